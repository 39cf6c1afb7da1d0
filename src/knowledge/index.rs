//! 인메모리 임베딩 인덱스
//!
//! 전수 코사인 스캔으로 결정적 top-k를 반환합니다.
//! - 정렬: 유사도 내림차순, 동률은 수집 순번 내림차순 (최근 수집 우선)
//! - 삭제: 소프트 삭제 (검색/조회에서 제외, 순번은 유지)
//! - 동시성: `RwLock` - 쓰기는 완성된 엔트리만 한 번에 넣으므로
//!   검색 중에 반쯤 들어간 청크가 보이지 않습니다.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{EngineError, Result};

use super::vector::{cosine_similarity, Chunk, EmbeddingIndex, IndexHit};

#[derive(Debug)]
struct Entry {
    chunk: Arc<Chunk>,
    /// 수집 순번 (클수록 최근)
    seq: u64,
    deleted: bool,
}

#[derive(Debug, Default)]
struct IndexState {
    entries: HashMap<String, Entry>,
    dimension: Option<usize>,
    next_seq: u64,
    live: usize,
}

/// 인메모리 임베딩 인덱스
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: RwLock<IndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 고정된 벡터 차원 (첫 청크 삽입 시 결정)
    pub fn dimension(&self) -> Option<usize> {
        self.state.read().ok().and_then(|s| s.dimension)
    }

    /// 삽입 가능 여부만 확인 (상태 변경 없음)
    ///
    /// 새 청크면 true, 같은 내용이 이미 있으면 false.
    /// 차원 불일치나 같은 ID의 다른 내용은 `InvalidQuery`.
    pub fn check(&self, chunk: &Chunk) -> Result<bool> {
        let state = self.state.read().map_err(EngineError::lock)?;
        Self::check_against(&state, chunk)
    }

    fn check_against(state: &IndexState, chunk: &Chunk) -> Result<bool> {
        Self::validate_vector(&chunk.embedding)?;

        if let Some(d) = state.dimension {
            if d != chunk.embedding.len() {
                return Err(EngineError::InvalidQuery(format!(
                    "chunk {} has {} dimensions, index uses {}",
                    chunk.id,
                    chunk.embedding.len(),
                    d
                )));
            }
        }

        match state.entries.get(&chunk.id) {
            Some(existing) if !existing.deleted => {
                if existing.chunk.same_content(chunk) {
                    Ok(false)
                } else {
                    Err(EngineError::InvalidQuery(format!(
                        "chunk {} is already ingested under topic {}",
                        chunk.id, existing.chunk.topic_id
                    )))
                }
            }
            _ => Ok(true),
        }
    }

    fn validate_vector(vector: &[f32]) -> Result<()> {
        if vector.is_empty() {
            return Err(EngineError::InvalidQuery("empty vector".to_string()));
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidQuery("vector contains NaN or infinity".to_string()));
        }
        Ok(())
    }

    fn search(&self, vector: &[f32], k: usize, topic_id: Option<&str>) -> Result<Vec<IndexHit>> {
        if k == 0 {
            return Err(EngineError::InvalidQuery("k must be positive".to_string()));
        }
        Self::validate_vector(vector)?;

        let state = self.state.read().map_err(EngineError::lock)?;

        // 빈 인덱스는 에러가 아닌 빈 결과
        let dimension = match state.dimension {
            Some(d) if state.live > 0 => d,
            _ => return Ok(vec![]),
        };
        if vector.len() != dimension {
            return Err(EngineError::InvalidQuery(format!(
                "expected {} dimensions, got {}",
                dimension,
                vector.len()
            )));
        }

        let mut scored: Vec<(f32, u64, &Arc<Chunk>)> = state
            .entries
            .values()
            .filter(|e| !e.deleted)
            .filter(|e| topic_id.map_or(true, |t| e.chunk.topic_id == t))
            .map(|e| (cosine_similarity(vector, &e.chunk.embedding), e.seq, &e.chunk))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(similarity, _, chunk)| IndexHit {
                chunk: Arc::clone(chunk),
                similarity,
            })
            .collect())
    }
}

impl EmbeddingIndex for MemoryIndex {
    fn upsert(&self, chunk: Chunk) -> Result<bool> {
        let mut state = self.state.write().map_err(EngineError::lock)?;
        if !Self::check_against(&state, &chunk)? {
            tracing::debug!("Chunk {} already ingested", chunk.id);
            return Ok(false);
        }

        if state.dimension.is_none() {
            state.dimension = Some(chunk.embedding.len());
        }
        let seq = state.next_seq;

        let id = chunk.id.clone();
        let revived = state
            .entries
            .insert(
                id.clone(),
                Entry {
                    chunk: Arc::new(chunk),
                    seq,
                    deleted: false,
                },
            )
            .is_some();
        state.next_seq += 1;
        state.live += 1;

        tracing::debug!("Indexed chunk {} (seq={}, revived={})", id, seq, revived);
        Ok(true)
    }

    fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        self.search(vector, k, None)
    }

    fn query_topic(&self, vector: &[f32], k: usize, topic_id: &str) -> Result<Vec<IndexHit>> {
        self.search(vector, k, Some(topic_id))
    }

    fn delete(&self, chunk_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(EngineError::lock)?;

        match state.entries.get_mut(chunk_id) {
            Some(entry) if !entry.deleted => {
                entry.deleted = true;
                state.live -= 1;
                tracing::debug!("Soft-deleted chunk {}", chunk_id);
                Ok(())
            }
            _ => Err(EngineError::not_found("chunk", chunk_id)),
        }
    }

    fn get(&self, chunk_id: &str) -> Option<Arc<Chunk>> {
        let state = self.state.read().ok()?;
        state
            .entries
            .get(chunk_id)
            .filter(|e| !e.deleted)
            .map(|e| Arc::clone(&e.chunk))
    }

    fn len(&self) -> usize {
        self.state.read().map(|s| s.live).unwrap_or(0)
    }
}

// ============================================================================
// Tests
// ============================================================================
