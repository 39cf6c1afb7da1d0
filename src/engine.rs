//! Learning Engine - 구성요소 조립 및 상위 계층용 파사드
//!
//! 수집 → 인덱스 → 검색 → 답변, 퀴즈 → 숙련도 → 계획 흐름을 한 곳에서 연결하고
//! 시작 시 `StudyStore`에서 상태를 복원합니다.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::composer::{AnswerComposer, ComposedAnswer};
use crate::config::EngineConfig;
use crate::curriculum::{Curriculum, CurriculumRegistry, Topic, TopicId};
use crate::embedding::{create_embedder, has_api_key, EmbeddingProvider};
use crate::error::{EngineError, Result};
use crate::knowledge::{
    default_chunker, Chunk, ChunkId, Chunker, Citation, EmbeddingIndex, MemoryIndex, Retriever,
    SourceRef, StoreStats, StudyStore,
};
use crate::llm::{GeminiModel, LanguageModel};
use crate::mastery::{GradeReport, MasteryModel, MasteryRecord, MasteryReport, QuizAttempt};
use crate::quiz::{DifficultyBand, ItemId, QuizBank, QuizGenerator, QuizItem};
use crate::retry::RetryPolicy;
use crate::scheduler::{QuizSelection, QuizSession, Scheduler, StudyPlan};

// ============================================================================
// Types
// ============================================================================

/// 커리큘럼 파일 (JSON)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurriculumFile {
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub quiz_items: Vec<QuizItem>,
}

/// 커리큘럼 적재 결과
#[derive(Debug, Clone, Serialize)]
pub struct CurriculumLoad {
    pub version: u64,
    pub topics: usize,
    pub new_quiz_items: usize,
}

/// 수집 결과
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub document: String,
    pub topic_id: TopicId,
    pub chunk_ids: Vec<ChunkId>,
    /// 이번에 새로 들어간 청크 수 (나머지는 이미 수집됨)
    pub new_chunks: usize,
}

/// 문항 생성 결과
#[derive(Debug, Clone, Serialize)]
pub struct QuizGeneration {
    pub topic_id: TopicId,
    pub band: DifficultyBand,
    /// 모델이 만든 유효 문항 수
    pub generated: usize,
    /// 그중 새로 등록된 문항 (이미 있던 문항 제외)
    pub new_items: Vec<QuizItem>,
}

/// 엔진 상태
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub curriculum_version: u64,
    pub topics: usize,
    pub indexed_chunks: usize,
    pub quiz_items: usize,
    pub embedding: String,
    pub language_model: Option<String>,
    pub store: StoreStats,
}

// ============================================================================
// LearningEngine
// ============================================================================

/// 적응형 학습 엔진
pub struct LearningEngine {
    config: EngineConfig,
    store: Arc<StudyStore>,
    curriculum: Arc<CurriculumRegistry>,
    /// 커리큘럼 교체와 토픽 참조 쓰기(수집, 문항 등록)를 직렬화
    curriculum_lock: Mutex<()>,
    index: Arc<MemoryIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Box<dyn Chunker>,
    retry: RetryPolicy,
    retriever: Arc<Retriever>,
    composer: Option<AnswerComposer>,
    generator: Option<QuizGenerator>,
    model_name: Option<String>,
    bank: Arc<QuizBank>,
    mastery: Arc<MasteryModel>,
    scheduler: Scheduler,
}

impl LearningEngine {
    /// 데이터 디렉토리에서 엔진 열기
    ///
    /// 언어 모델은 API 키가 있을 때만 구성됩니다 (없으면 `ask` 불가).
    pub fn open(data_dir: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = StudyStore::open_in(data_dir)?;
        let embedder = create_embedder(&config.embedding)?;

        let model: Option<Arc<dyn LanguageModel>> = if has_api_key() {
            Some(Arc::new(GeminiModel::from_env(config.llm.clone())?))
        } else {
            tracing::debug!("No API key, answer composition disabled");
            None
        };

        Self::with_components(config, store, embedder, model)
    }

    /// 구성요소를 직접 지정하여 생성 (저장소 상태 복원 포함)
    pub fn with_components(
        config: EngineConfig,
        store: StudyStore,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Option<Arc<dyn LanguageModel>>,
    ) -> Result<Self> {
        let store = Arc::new(store);
        let retry = RetryPolicy::from_config(&config.retry);

        // 1. 커리큘럼
        let curriculum = store.load_curriculum()?.unwrap_or_else(Curriculum::empty);
        let curriculum = Arc::new(CurriculumRegistry::new(curriculum));

        // 2. 퀴즈 문항
        let bank = Arc::new(QuizBank::new());
        bank.restore(store.load_quiz_items()?)?;

        // 3. 청크 인덱스 (수집 순서대로 재적재)
        let index = Arc::new(MemoryIndex::new());
        for chunk in store.load_chunks()? {
            if chunk.embedding.len() != embedder.dimension() {
                return Err(EngineError::Config(format!(
                    "stored chunks use {} dimensions but {} produces {}",
                    chunk.embedding.len(),
                    embedder.name(),
                    embedder.dimension()
                )));
            }
            index.upsert(chunk)?;
        }

        // 4. 숙련도
        let mastery = Arc::new(MasteryModel::new(
            config.mastery.clone(),
            Arc::clone(&curriculum),
            Arc::clone(&bank),
            store.clone(),
        ));
        mastery.restore(store.load_mastery_revisions()?, store.load_last_correct()?)?;

        let retriever = Arc::new(Retriever::new(
            index.clone(),
            Arc::clone(&embedder),
            retry.clone(),
            config.retrieval.clone(),
        ));
        let model_name = model.as_ref().map(|m| m.name().to_string());
        let (composer, generator) = match model {
            Some(model) => (
                Some(AnswerComposer::new(Arc::clone(&model), retry.clone())?),
                Some(QuizGenerator::new(model, Arc::clone(&retriever), retry.clone())?),
            ),
            None => (None, None),
        };
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            Arc::clone(&curriculum),
            Arc::clone(&mastery),
            Arc::clone(&bank),
            store.clone(),
        );

        tracing::info!(
            "Engine ready: curriculum v{}, {} chunks, {} quiz items",
            curriculum.current().version(),
            index.len(),
            bank.len()
        );

        Ok(Self {
            config,
            store,
            curriculum,
            curriculum_lock: Mutex::new(()),
            index,
            embedder,
            chunker: default_chunker(),
            retry,
            retriever,
            composer,
            generator,
            model_name,
            bank,
            mastery,
            scheduler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn curriculum(&self) -> Arc<Curriculum> {
        self.curriculum.current()
    }

    // ------------------------------------------------------------------------
    // Curriculum & Content
    // ------------------------------------------------------------------------

    /// 커리큘럼 게시 + 퀴즈 문항 등록
    ///
    /// 토픽 검증, 문항 검증, 참조 중인 토픽 확인을 모두 통과해야 저장과 교체가
    /// 일어납니다. 하나라도 실패하면 이전 버전과 문항 은행이 그대로 남습니다.
    /// 기존 버전을 들고 있는 요청은 그 스냅샷을 계속 사용합니다.
    pub fn load_curriculum(&self, file: CurriculumFile) -> Result<CurriculumLoad> {
        let _guard = self.curriculum_lock.lock().map_err(EngineError::lock)?;
        let current = self.curriculum.current();
        let next = Curriculum::new(current.version() + 1, file.topics)?;

        // 청크, 문항, 숙련도 기록이 남아 있는 토픽은 뺄 수 없음
        let retired: Vec<TopicId> = self
            .store
            .referenced_topics()?
            .into_iter()
            .filter(|t| !next.contains(t))
            .collect();
        if !retired.is_empty() {
            return Err(EngineError::InvalidCurriculum(format!(
                "topics still referenced by material, quiz items or mastery: {}",
                retired.join(", ")
            )));
        }

        let mut new_items: Vec<QuizItem> = Vec::new();
        for item in file.quiz_items {
            if !self.bank.check(&next, &item)? {
                continue;
            }
            match new_items.iter().find(|i| i.id == item.id) {
                Some(seen) if *seen == item => {}
                Some(_) => {
                    return Err(EngineError::InvalidQuery(format!(
                        "quiz item {} appears twice with different content",
                        item.id
                    )))
                }
                None => new_items.push(item),
            }
        }

        self.store.save_curriculum(&next, &new_items)?;
        let curriculum = self.curriculum.install(next)?;
        for item in &new_items {
            self.bank.insert(&curriculum, item.clone())?;
        }

        Ok(CurriculumLoad {
            version: curriculum.version(),
            topics: curriculum.len(),
            new_quiz_items: new_items.len(),
        })
    }

    /// 텍스트 자료 수집 (청킹 → 임베딩 → 저장 → 인덱스)
    pub async fn ingest_text(&self, document: &str, topic_id: &str, text: &str) -> Result<IngestReport> {
        if !self.curriculum.current().contains(topic_id) {
            return Err(EngineError::UnknownTopic(topic_id.to_string()));
        }

        let spans = self.chunker.chunk(text);
        let mut report = IngestReport {
            document: document.to_string(),
            topic_id: topic_id.to_string(),
            chunk_ids: Vec::with_capacity(spans.len()),
            new_chunks: 0,
        };
        if spans.is_empty() {
            tracing::warn!("No chunks generated for document: {}", document);
            return Ok(report);
        }

        tracing::debug!(
            "Chunked {} with {}: {} spans",
            document,
            self.chunker.name(),
            spans.len()
        );

        let texts: Vec<String> = spans.iter().map(|s| s.text.clone()).collect();
        let embedder = Arc::clone(&self.embedder);
        let embeddings = self
            .retry
            .run("chunk embedding", || {
                let embedder = Arc::clone(&embedder);
                let texts = &texts;
                async move { embedder.embed_batch(texts).await }
            })
            .await?;

        let chunks: Vec<Chunk> = spans
            .into_iter()
            .zip(embeddings)
            .map(|(span, embedding)| {
                Chunk::new(
                    topic_id,
                    span.text,
                    embedding,
                    SourceRef::new(document, span.start, span.end),
                )
            })
            .collect();
        report.chunk_ids = chunks.iter().map(|c| c.id.clone()).collect();
        report.new_chunks = self.commit_chunks(topic_id, chunks)?;

        tracing::info!(
            "Ingested {} ({}): {} chunks, {} new",
            document,
            topic_id,
            report.chunk_ids.len(),
            report.new_chunks
        );
        Ok(report)
    }

    /// 청크 일괄 기록
    ///
    /// 먼저 모든 청크를 인덱스 기준으로 검사하고, 충돌이 하나라도 있으면
    /// 저장소와 인덱스 어느 쪽에도 쓰지 않습니다.
    fn commit_chunks(&self, topic_id: &str, chunks: Vec<Chunk>) -> Result<usize> {
        let _guard = self.curriculum_lock.lock().map_err(EngineError::lock)?;
        if !self.curriculum.current().contains(topic_id) {
            return Err(EngineError::UnknownTopic(topic_id.to_string()));
        }

        let mut fresh: Vec<Chunk> = Vec::new();
        for chunk in chunks {
            if self.index.check(&chunk)? && !fresh.iter().any(|c| c.id == chunk.id) {
                fresh.push(chunk);
            }
        }

        self.store.save_chunks(&fresh)?;
        let mut added = 0;
        for chunk in fresh {
            if self.index.upsert(chunk)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// 청크 소프트 삭제
    pub fn delete_chunk(&self, chunk_id: &str) -> Result<()> {
        self.index.delete(chunk_id)?;
        self.store.mark_chunk_deleted(chunk_id)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Question Answering
    // ------------------------------------------------------------------------

    /// 인용 검색 (`k`가 없으면 설정의 기본값)
    pub async fn retrieve(&self, question: &str, topic_hint: Option<&str>, k: Option<usize>) -> Result<Vec<Citation>> {
        let k = k.unwrap_or(self.config.retrieval.default_k);
        self.retriever.retrieve(question, topic_hint, k).await
    }

    /// 검색 + 근거 기반 답변
    pub async fn ask(&self, question: &str, topic_hint: Option<&str>, k: Option<usize>) -> Result<ComposedAnswer> {
        let composer = self.composer.as_ref().ok_or_else(model_missing)?;
        let citations = self.retrieve(question, topic_hint, k).await?;
        composer.answer(question, &citations).await
    }

    // ------------------------------------------------------------------------
    // Quiz & Mastery
    // ------------------------------------------------------------------------

    pub fn select_quiz(&self, student_id: &str, topic_id: &str, n: usize) -> Result<QuizSelection> {
        self.scheduler.select_quiz(student_id, topic_id, n, Utc::now())
    }

    /// 세션 단위 퀴즈 선택 (세션 안에서 중복 없음)
    pub fn select_quiz_in(&self, session: &mut QuizSession, topic_id: &str, n: usize) -> Result<QuizSelection> {
        self.scheduler.select_quiz_in(session, topic_id, n, Utc::now())
    }

    /// 답안 제출 (문항 ID, 선택한 보기 인덱스)
    pub fn submit_answers(&self, student_id: &str, answers: &[(ItemId, usize)]) -> Result<GradeReport> {
        self.submit_answers_at(student_id, answers, Utc::now())
    }

    pub fn submit_answers_at(
        &self,
        student_id: &str,
        answers: &[(ItemId, usize)],
        now: DateTime<Utc>,
    ) -> Result<GradeReport> {
        self.mastery.grade(student_id, answers, now)
    }

    /// 수집된 자료로 문항 생성 후 문항 은행에 등록
    ///
    /// 이미 같은 문항이 있으면 건너뛰고, 같은 ID에 다른 내용이면 경고 후 버립니다.
    pub async fn generate_quiz(&self, topic_id: &str, band: DifficultyBand, n: usize) -> Result<QuizGeneration> {
        let generator = self.generator.as_ref().ok_or_else(model_missing)?;
        let topic = self
            .curriculum
            .current()
            .topic(topic_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTopic(topic_id.to_string()))?;

        let generated = generator.generate(&topic, band, n).await?;
        let count = generated.len();
        let new_items = self.register_generated(topic_id, generated)?;

        Ok(QuizGeneration {
            topic_id: topic_id.to_string(),
            band,
            generated: count,
            new_items,
        })
    }

    fn register_generated(&self, topic_id: &str, generated: Vec<QuizItem>) -> Result<Vec<QuizItem>> {
        let _guard = self.curriculum_lock.lock().map_err(EngineError::lock)?;
        let curriculum = self.curriculum.current();
        if !curriculum.contains(topic_id) {
            return Err(EngineError::UnknownTopic(topic_id.to_string()));
        }

        let mut fresh: Vec<QuizItem> = Vec::new();
        for item in generated {
            match self.bank.check(&curriculum, &item) {
                Ok(true) => fresh.push(item),
                Ok(false) => {}
                Err(e) => tracing::warn!("Discarding generated item {}: {}", item.id, e),
            }
        }

        self.store.save_quiz_items(&fresh)?;
        for item in &fresh {
            self.bank.insert(&curriculum, item.clone())?;
        }
        Ok(fresh)
    }

    pub fn quiz_item(&self, item_id: &str) -> Option<Arc<QuizItem>> {
        self.bank.get(item_id)
    }

    pub fn snapshot(&self, student_id: &str) -> Result<std::collections::BTreeMap<TopicId, MasteryRecord>> {
        self.mastery.snapshot(student_id)
    }

    pub fn mastery_history(&self, student_id: &str, topic_id: &str) -> Result<Vec<MasteryRecord>> {
        self.mastery.history(student_id, topic_id)
    }

    pub fn report(&self, student_id: &str) -> Result<MasteryReport> {
        self.mastery.report(student_id, Utc::now())
    }

    /// 저장된 시도 기록 (시간순)
    pub fn attempts(&self, student_id: &str) -> Result<Vec<QuizAttempt>> {
        self.store.attempts_for(student_id)
    }

    // ------------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------------

    pub fn generate_plan(&self, student_id: &str, budget_minutes: u32) -> Result<StudyPlan> {
        self.scheduler.generate_plan(student_id, budget_minutes, Utc::now())
    }

    pub fn generate_plan_cancellable(
        &self,
        student_id: &str,
        budget_minutes: u32,
        cancel: &CancellationToken,
    ) -> Result<StudyPlan> {
        self.scheduler
            .generate_plan_cancellable(student_id, budget_minutes, Utc::now(), cancel)
    }

    pub fn plan_history(&self, student_id: &str) -> Result<Vec<StudyPlan>> {
        self.scheduler.plan_history(student_id)
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    pub fn status(&self) -> Result<EngineStatus> {
        let curriculum = self.curriculum.current();
        Ok(EngineStatus {
            curriculum_version: curriculum.version(),
            topics: curriculum.len(),
            indexed_chunks: self.index.len(),
            quiz_items: self.bank.len(),
            embedding: self.embedder.name().to_string(),
            language_model: self.model_name.clone(),
            store: self.store.stats()?,
        })
    }
}

fn model_missing() -> EngineError {
    EngineError::Config(
        "language model not configured. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY".to_string(),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashedEmbedding;
    use crate::quiz::QuizContent;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// 답변 요청에는 첫 번째 출처를 인용하고, 문항 요청에는 고정 JSON을 돌려주는 모델
    struct TutorModel;

    #[async_trait]
    impl LanguageModel for TutorModel {
        async fn generate(&self, prompt: &str) -> Result<String> {
            if prompt.contains("NUMBER OF QUESTIONS") {
                return Ok(QUIZ_JSON.to_string());
            }
            Ok("Voltage equals current times resistance [S1].".to_string())
        }

        fn name(&self) -> &str {
            "tutor"
        }
    }

    const QUIZ_JSON: &str = r#"```json
{"topic": "Circuits", "difficulty_level": "easy", "questions": [
  {"question": "What do circuits carry?", "options": ["Current", "Sound", "Light only", "Nothing"], "correct_index": 0, "explanation": "Circuits carry current."}
]}
```"#;

    const OHM: &str = "Ohm's law states that voltage equals current times resistance.";
    const FOURIER: &str = "The Fourier transform decomposes a signal into frequency components.";
    const CIRCUIT_NOTES: &str = "Circuits circuits circuits carry current.";

    fn quiz(id: &str, topic: &str, difficulty: f64) -> QuizItem {
        QuizItem {
            id: id.to_string(),
            topic_id: topic.to_string(),
            difficulty,
            item: QuizContent {
                question: format!("{}?", id),
                options: vec!["right".into(), "wrong".into()],
                correct_index: 0,
                explanation: String::new(),
            },
        }
    }

    fn curriculum_file() -> CurriculumFile {
        CurriculumFile {
            topics: vec![
                Topic::new("circuits", "Circuits"),
                Topic::new("signals", "Signals").with_prerequisites(["circuits"]),
            ],
            quiz_items: vec![
                quiz("c1", "circuits", 0.2),
                quiz("c2", "circuits", 0.5),
                quiz("s1", "signals", 0.4),
            ],
        }
    }

    fn open_engine(dir: &TempDir) -> LearningEngine {
        let mut config = EngineConfig::default();
        config.retrieval.relevance_threshold = 0.3;
        config.retry.max_retries = 0;

        LearningEngine::with_components(
            config,
            StudyStore::open_in(dir.path()).unwrap(),
            Arc::new(HashedEmbedding::new(64)),
            Some(Arc::new(TutorModel)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_flow() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        let load = engine.load_curriculum(curriculum_file()).unwrap();
        assert_eq!(load.version, 1);
        assert_eq!(load.new_quiz_items, 3);

        let report = engine.ingest_text("circuits.pdf", "circuits", OHM).await.unwrap();
        assert_eq!(report.new_chunks, 1);
        engine.ingest_text("signals.pdf", "signals", FOURIER).await.unwrap();

        // 같은 자료 재수집은 멱등
        let again = engine.ingest_text("circuits.pdf", "circuits", OHM).await.unwrap();
        assert_eq!(again.new_chunks, 0);

        let answer = engine.ask(OHM, None, Some(3)).await.unwrap();
        assert_eq!(answer.citation_refs.len(), 1);
        assert_eq!(answer.citation_refs[0].source_ref.document, "circuits.pdf");

        let selection = engine.select_quiz("alice", "circuits", 5).unwrap();
        assert_eq!(selection.items.len(), 2);
        assert!(selection.shortfall.is_some());

        let graded = engine
            .submit_answers("alice", &[("c1".to_string(), 0), ("c2".to_string(), 0)])
            .unwrap();
        assert_eq!(graded.correct, 2);

        let plan = engine.generate_plan("alice", 120).unwrap();
        assert_eq!(plan.total_minutes(), 120);
        assert_eq!(plan.entries[0].topic_id, "circuits");

        let status = engine.status().unwrap();
        assert_eq!(status.indexed_chunks, 2);
        assert_eq!(status.quiz_items, 3);
        assert_eq!(status.store.plan_count, 1);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let chunk_id = {
            let engine = open_engine(&dir);
            engine.load_curriculum(curriculum_file()).unwrap();
            let report = engine.ingest_text("circuits.pdf", "circuits", OHM).await.unwrap();
            engine.ingest_text("signals.pdf", "signals", FOURIER).await.unwrap();
            engine.submit_answers("alice", &[("c1".to_string(), 0)]).unwrap();
            engine.generate_plan("alice", 90).unwrap();
            report.chunk_ids[0].clone()
        };

        let engine = open_engine(&dir);
        assert_eq!(engine.curriculum().version(), 1);
        assert_eq!(engine.status().unwrap().indexed_chunks, 2);
        assert_eq!(engine.snapshot("alice").unwrap()["circuits"].attempts, 1);
        assert_eq!(engine.attempts("alice").unwrap().len(), 1);
        assert_eq!(engine.plan_history("alice").unwrap().len(), 1);

        engine.delete_chunk(&chunk_id).unwrap();
        drop(engine);

        let engine = open_engine(&dir);
        assert_eq!(engine.status().unwrap().indexed_chunks, 1);
        let err = engine.retrieve(OHM, Some("circuits"), None).await.unwrap_err();
        assert!(matches!(err, EngineError::NoGroundingFound { .. }));
    }

    #[tokio::test]
    async fn test_ingest_unknown_topic_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        engine.load_curriculum(curriculum_file()).unwrap();

        let err = engine.ingest_text("x.pdf", "thermo", OHM).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownTopic(_)));
    }

    #[tokio::test]
    async fn test_ask_without_model_is_config_error() {
        let dir = TempDir::new().unwrap();
        let engine = LearningEngine::with_components(
            EngineConfig::default(),
            StudyStore::open_in(dir.path()).unwrap(),
            Arc::new(HashedEmbedding::new(64)),
            None,
        )
        .unwrap();

        assert!(matches!(engine.ask("Q", None, None).await, Err(EngineError::Config(_))));
        assert!(engine.status().unwrap().language_model.is_none());
    }

    #[test]
    fn test_cancelled_plan_not_persisted() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        engine.load_curriculum(curriculum_file()).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            engine.generate_plan_cancellable("alice", 60, &token),
            Err(EngineError::Cancelled)
        ));
        assert_eq!(engine.status().unwrap().store.plan_count, 0);
    }

    #[tokio::test]
    async fn test_same_text_under_another_topic_keeps_original() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open_engine(&dir);
            engine.load_curriculum(curriculum_file()).unwrap();
            engine.ingest_text("notes.md", "circuits", OHM).await.unwrap();

            let err = engine.ingest_text("notes.md", "signals", OHM).await.unwrap_err();
            assert!(matches!(err, EngineError::InvalidQuery(_)));
            assert_eq!(engine.status().unwrap().indexed_chunks, 1);
        }

        let engine = open_engine(&dir);
        let citations = engine.retrieve(OHM, Some("circuits"), None).await.unwrap();
        assert_eq!(citations[0].topic_id, "circuits");
        assert!(matches!(
            engine.retrieve(OHM, Some("signals"), None).await,
            Err(EngineError::NoGroundingFound { .. })
        ));
    }

    #[test]
    fn test_rejected_curriculum_changes_nothing() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open_engine(&dir);
            engine.load_curriculum(curriculum_file()).unwrap();

            let mut bad_item = quiz("t1", "thermo", 0.5);
            bad_item.item.correct_index = 5;
            let mut file = curriculum_file();
            file.topics.push(Topic::new("thermo", "Thermodynamics"));
            file.quiz_items.push(quiz("t0", "thermo", 0.3));
            file.quiz_items.push(bad_item);
            assert!(matches!(engine.load_curriculum(file), Err(EngineError::InvalidQuery(_))));

            let mut orphan = curriculum_file();
            orphan.quiz_items.push(quiz("x1", "optics", 0.3));
            assert!(matches!(engine.load_curriculum(orphan), Err(EngineError::UnknownTopic(_))));

            assert_eq!(engine.curriculum().version(), 1);
            assert!(!engine.curriculum().contains("thermo"));
            assert!(engine.quiz_item("t0").is_none());
        }

        let engine = open_engine(&dir);
        assert_eq!(engine.curriculum().version(), 1);
        assert!(!engine.curriculum().contains("thermo"));
        assert_eq!(engine.status().unwrap().quiz_items, 3);
    }

    #[tokio::test]
    async fn test_referenced_topic_cannot_be_retired() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);
        let topics_only = |topics: Vec<Topic>| CurriculumFile {
            topics,
            quiz_items: Vec::new(),
        };
        let circuits = || Topic::new("circuits", "Circuits");
        let signals = || Topic::new("signals", "Signals");

        engine.load_curriculum(topics_only(vec![circuits(), signals()])).unwrap();
        engine.ingest_text("fourier.pdf", "signals", FOURIER).await.unwrap();

        let err = engine.load_curriculum(topics_only(vec![circuits()])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCurriculum(msg) if msg.contains("signals")));
        assert_eq!(engine.curriculum().version(), 1);

        let thermo = Topic::new("thermo", "Thermodynamics");
        assert_eq!(
            engine
                .load_curriculum(topics_only(vec![circuits(), signals(), thermo]))
                .unwrap()
                .version,
            2
        );
        // 아무도 참조하지 않는 토픽은 뺄 수 있음
        assert_eq!(
            engine
                .load_curriculum(topics_only(vec![circuits(), signals()]))
                .unwrap()
                .version,
            3
        );
    }

    #[tokio::test]
    async fn test_generated_quiz_items_are_registered() {
        let dir = TempDir::new().unwrap();
        let item_id = {
            let engine = open_engine(&dir);
            engine.load_curriculum(curriculum_file()).unwrap();
            engine.ingest_text("circuits.md", "circuits", CIRCUIT_NOTES).await.unwrap();

            let generation = engine.generate_quiz("circuits", DifficultyBand::Easy, 3).await.unwrap();
            assert_eq!(generation.generated, 1);
            assert_eq!(generation.new_items.len(), 1);
            assert_eq!(engine.status().unwrap().quiz_items, 4);

            let again = engine.generate_quiz("circuits", DifficultyBand::Easy, 3).await.unwrap();
            assert!(again.new_items.is_empty());

            assert!(matches!(
                engine.generate_quiz("optics", DifficultyBand::Easy, 3).await,
                Err(EngineError::UnknownTopic(_))
            ));
            assert!(matches!(
                engine.generate_quiz("signals", DifficultyBand::Easy, 3).await,
                Err(EngineError::NoGroundingFound { .. })
            ));
            generation.new_items[0].id.clone()
        };

        let engine = open_engine(&dir);
        let item = engine.quiz_item(&item_id).unwrap();
        assert_eq!(item.topic_id, "circuits");
        assert_eq!(item.band(), DifficultyBand::Easy);
    }
}
