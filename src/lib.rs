//! study-copilot - 근거 기반 적응형 학습 엔진
//!
//! 학습 자료를 임베딩 인덱스로 구성해 출처가 인용된 답변을 만들고,
//! 퀴즈 결과로 토픽별 숙련도를 추적하여 주간 학습 계획을 생성합니다.

pub mod cli;
pub mod composer;
pub mod config;
pub mod curriculum;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod knowledge;
pub mod llm;
pub mod mastery;
pub mod quiz;
pub mod retry;
pub mod scheduler;

// Re-exports
pub use composer::{AnswerComposer, ComposedAnswer};
pub use config::{get_data_dir, EngineConfig, PrerequisitePolicy};
pub use curriculum::{Curriculum, CurriculumRegistry, Topic, TopicId};
pub use embedding::{
    create_embedder, get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding, HashedEmbedding,
};
pub use engine::{
    CurriculumFile, CurriculumLoad, EngineStatus, IngestReport, LearningEngine, QuizGeneration,
};
pub use error::{EngineError, Result};
pub use knowledge::{
    Chunk, ChunkId, Citation, EmbeddingIndex, IndexHit, MemoryIndex, Retriever, SourceRef,
    StoreStats, StudyStore,
};
pub use llm::{GeminiModel, LanguageModel};
pub use mastery::{GradeReport, MasteryModel, MasteryRecord, MasteryReport, QuizAttempt, StudentId};
pub use quiz::{DifficultyBand, ItemId, QuizBank, QuizContent, QuizGenerator, QuizItem};
pub use retry::RetryPolicy;
pub use scheduler::{PlanEntry, QuizSelection, QuizSession, Scheduler, Shortfall, StudyPlan};
