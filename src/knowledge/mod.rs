//! Knowledge 모듈 - 인용 근거 검색 계층
//!
//! - Vector: 청크/출처 타입과 `EmbeddingIndex` 트레이트
//! - Index: 인메모리 코사인 인덱스 (소프트 삭제, 결정적 정렬)
//! - Chunker: 문장 경계 인식 텍스트 분할
//! - Retriever: 임계값 + 중복 제거 검색
//! - Store: SQLite 영속 저장소

mod chunker;
mod index;
mod retriever;
mod store;
mod vector;

// Re-exports
pub use chunker::{default_chunker, ChunkConfig, Chunker, SentenceChunker, TextSpan};
pub use index::MemoryIndex;
pub use retriever::{Citation, Retriever};
pub use store::{StoreStats, StudyStore, DB_FILE_NAME};
pub use vector::{content_id, cosine_similarity, Chunk, ChunkId, EmbeddingIndex, IndexHit, SourceRef};
