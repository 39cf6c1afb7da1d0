//! Vector 타입 - 청크, 출처, 임베딩 인덱스 트레이트
//!
//! 청크는 수집 후 불변이며 인덱스가 단독 소유합니다.
//! 검색 결과(`IndexHit`)는 조회 시점의 청크 스냅샷(`Arc<Chunk>`)을 들고 나옵니다.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::curriculum::TopicId;
use crate::error::Result;

/// 청크 ID
pub type ChunkId = String;

// ============================================================================
// Types
// ============================================================================

/// 청크 출처 (문서 + 바이트 구간)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// 원본 문서 이름 (파일명 등)
    pub document: String,
    /// 시작 바이트 오프셋 (포함)
    pub start: usize,
    /// 끝 바이트 오프셋 (제외)
    pub end: usize,
}

impl SourceRef {
    pub fn new(document: impl Into<String>, start: usize, end: usize) -> Self {
        Self {
            document: document.into(),
            start,
            end,
        }
    }

    /// 같은 문서에서 구간이 겹치는지
    pub fn overlaps(&self, other: &SourceRef) -> bool {
        self.document == other.document && self.start < other.end && other.start < self.end
    }

    /// 겹친 길이 / 짧은 쪽 길이 (다른 문서거나 겹치지 않으면 0.0)
    pub fn overlap_ratio(&self, other: &SourceRef) -> f32 {
        if !self.overlaps(other) {
            return 0.0;
        }
        let overlap = self.end.min(other.end) - self.start.max(other.start);
        let shorter = (self.end - self.start).min(other.end - other.start).max(1);
        overlap as f32 / shorter as f32
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}-{}", self.document, self.start, self.end)
    }
}

/// 강의 자료 청크
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub topic_id: TopicId,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source_ref: SourceRef,
}

impl Chunk {
    /// 내용 기반 ID로 청크 생성
    ///
    /// 같은 문서/구간/텍스트는 항상 같은 ID가 되어 재수집이 멱등입니다.
    pub fn new(
        topic_id: impl Into<String>,
        text: impl Into<String>,
        embedding: Vec<f32>,
        source_ref: SourceRef,
    ) -> Self {
        let text = text.into();
        let id = content_id(&source_ref, &text);
        Self {
            id,
            topic_id: topic_id.into(),
            text,
            embedding,
            source_ref,
        }
    }

    /// 같은 토픽, 같은 출처, 같은 본문인지 (임베딩 값은 비교하지 않음)
    pub fn same_content(&self, other: &Chunk) -> bool {
        self.id == other.id
            && self.topic_id == other.topic_id
            && self.source_ref == other.source_ref
            && self.text == other.text
    }
}

/// SHA-256(document, start, end, text) 앞 16바이트의 hex
pub fn content_id(source_ref: &SourceRef, text: &str) -> ChunkId {
    let mut hasher = Sha256::new();
    hasher.update(source_ref.document.as_bytes());
    hasher.update([0u8]);
    hasher.update(source_ref.start.to_le_bytes());
    hasher.update(source_ref.end.to_le_bytes());
    hasher.update(text.as_bytes());
    hasher.finalize()[..16]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// 인덱스 검색 결과
#[derive(Debug, Clone)]
pub struct IndexHit {
    /// 조회 시점의 청크
    pub chunk: Arc<Chunk>,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub similarity: f32,
}

// ============================================================================
// EmbeddingIndex Trait
// ============================================================================

/// 임베딩 인덱스 트레이트
///
/// 구현체는 쓰기(수집) 중에도 읽기(검색)가 일관된 스냅샷을 보도록 해야 합니다.
pub trait EmbeddingIndex: Send + Sync {
    /// 청크 삽입. 새로 들어갔으면 true, 동일 청크가 이미 있으면 false
    fn upsert(&self, chunk: Chunk) -> Result<bool>;

    /// 코사인 유사도 상위 k개 (동률은 최근 수집 순)
    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>>;

    /// 특정 토픽으로 제한한 검색
    fn query_topic(&self, vector: &[f32], k: usize, topic_id: &str) -> Result<Vec<IndexHit>>;

    /// 소프트 삭제
    fn delete(&self, chunk_id: &str) -> Result<()>;

    /// 살아있는 청크 조회
    fn get(&self, chunk_id: &str) -> Option<Arc<Chunk>>;

    /// 살아있는 청크 수
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위이며, 길이가 다르거나 영벡터면 0.0입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
