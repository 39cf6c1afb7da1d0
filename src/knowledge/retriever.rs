//! Retriever - 질문을 인용 가능한 근거 청크로 변환
//!
//! 1. 질문 임베딩 (재시도 포함)
//! 2. 인덱스에서 k * candidate_multiplier 후보 조회
//! 3. 관련도 임계값 미만 제거
//! 4. 같은 문서에서 `dedup_overlap_ratio` 이상 겹치는 구간 중복 제거 (높은 점수 유지)
//! 5. 상위 k개, 결과가 비면 `NoGroundingFound`
//!
//! 같은 인덱스 상태와 같은 입력이면 항상 같은 순서의 인용 목록을 반환합니다.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::curriculum::TopicId;
use crate::embedding::EmbeddingProvider;
use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;

use super::vector::{ChunkId, EmbeddingIndex, IndexHit, SourceRef};

// ============================================================================
// Types
// ============================================================================

/// 인용 (인덱스 청크에 대한 약한 참조)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: ChunkId,
    pub source_ref: SourceRef,
    /// 코사인 유사도
    pub score: f32,
    pub topic_id: TopicId,
    /// 프롬프트 구성용 청크 본문
    pub excerpt: String,
}

impl From<&IndexHit> for Citation {
    fn from(hit: &IndexHit) -> Self {
        Self {
            chunk_id: hit.chunk.id.clone(),
            source_ref: hit.chunk.source_ref.clone(),
            score: hit.similarity,
            topic_id: hit.chunk.topic_id.clone(),
            excerpt: hit.chunk.text.clone(),
        }
    }
}

// ============================================================================
// Retriever
// ============================================================================

/// 인용 기반 검색기
pub struct Retriever {
    index: Arc<dyn EmbeddingIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        index: Arc<dyn EmbeddingIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        retry: RetryPolicy,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// 질문에 대한 인용 목록
    ///
    /// # Arguments
    /// * `question` - 자유 텍스트 질문
    /// * `topic_hint` - 지정 시 해당 토픽 청크로만 제한
    /// * `k` - 최대 인용 수
    pub async fn retrieve(
        &self,
        question: &str,
        topic_hint: Option<&str>,
        k: usize,
    ) -> Result<Vec<Citation>> {
        let question = question.trim();
        if question.is_empty() {
            return Err(EngineError::InvalidQuery("question is empty".to_string()));
        }
        if k == 0 {
            return Err(EngineError::InvalidQuery("k must be positive".to_string()));
        }

        let embedder = Arc::clone(&self.embedder);
        let vector = self
            .retry
            .run("question embedding", || {
                let embedder = Arc::clone(&embedder);
                async move { embedder.embed(question).await }
            })
            .await?;

        let candidates = k.saturating_mul(self.config.candidate_multiplier.max(1));
        let hits = match topic_hint {
            Some(topic) => self.index.query_topic(&vector, candidates, topic)?,
            None => self.index.query(&vector, candidates)?,
        };

        let citations = select_citations(
            &hits,
            self.config.relevance_threshold,
            self.config.dedup_overlap_ratio,
            k,
        );

        if citations.is_empty() {
            tracing::debug!(
                "No grounding for question ({} candidates, threshold {})",
                hits.len(),
                self.config.relevance_threshold
            );
            return Err(EngineError::NoGroundingFound {
                threshold: self.config.relevance_threshold,
            });
        }

        tracing::debug!(
            "Retrieved {} citations from {} candidates",
            citations.len(),
            hits.len()
        );
        Ok(citations)
    }
}

/// 임계값 필터 + 겹침 중복 제거 + 상위 k
///
/// `hits`는 이미 점수 순으로 정렬되어 있어야 합니다. 청커가 의도적으로 겹쳐 둔
/// 인접 청크는 겹침 비율이 `overlap_ratio` 미만이라 둘 다 남습니다.
fn select_citations(hits: &[IndexHit], threshold: f32, overlap_ratio: f32, k: usize) -> Vec<Citation> {
    let mut kept: Vec<Citation> = Vec::with_capacity(k);

    for hit in hits.iter().filter(|h| h.similarity >= threshold) {
        if kept.len() >= k {
            break;
        }
        let duplicate = kept
            .iter()
            .any(|c| c.source_ref.overlap_ratio(&hit.chunk.source_ref) >= overlap_ratio);
        if duplicate {
            continue;
        }
        kept.push(Citation::from(hit));
    }

    kept
}

// ============================================================================
// Tests
// ============================================================================
