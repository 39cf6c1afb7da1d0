//! 엔진 설정
//!
//! 모든 튜닝 상수(학습률, 반감기, 관련도 임계값 등)는 여기서 관리합니다.
//! 저장 위치: `<data_dir>/config.toml` (없으면 기본값)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// 데이터 디렉토리 환경변수
pub const DATA_DIR_ENV: &str = "STUDY_COPILOT_DATA_DIR";

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.study-copilot/)
///
/// `STUDY_COPILOT_DATA_DIR`이 설정되어 있으면 그 경로를 사용합니다.
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".study-copilot")
}

// ============================================================================
// EngineConfig
// ============================================================================

/// 엔진 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub mastery: MasteryConfig,
    pub scheduler: SchedulerConfig,
    pub retry: RetryConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

/// 검색 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// 코사인 유사도 하한 (미만은 top-k 안이어도 버림)
    pub relevance_threshold: f32,
    /// 기본 인용 개수
    pub default_k: usize,
    /// 중복 제거 전에 k의 몇 배를 가져올지
    pub candidate_multiplier: usize,
    /// 같은 문서의 두 구간이 짧은 쪽 길이 대비 이 비율 이상 겹치면 중복으로 봄
    ///
    /// 청커의 겹침(기본 200/1000)보다 커야 인접 청크가 함께 인용됩니다.
    pub dedup_overlap_ratio: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            relevance_threshold: 0.5,
            default_k: 5,
            candidate_multiplier: 3,
            dedup_overlap_ratio: 0.5,
        }
    }
}

/// 숙련도 모델 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasteryConfig {
    pub learning_rate: f64,
    /// 시도마다 confidence += (1 - confidence) * confidence_gain
    pub confidence_gain: f64,
    /// confidence 반감기 (시간 단위)
    pub confidence_half_life_hours: f64,
    /// 첫 시도 전 레코드의 초기값
    pub initial_score: f64,
    pub initial_confidence: f64,
}

impl Default for MasteryConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.2,
            confidence_gain: 0.25,
            confidence_half_life_hours: 24.0 * 14.0,
            initial_score: 0.0,
            initial_confidence: 0.0,
        }
    }
}

impl MasteryConfig {
    pub fn half_life(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.confidence_half_life_hours * 3_600_000.0) as i64)
    }
}

/// 선수 토픽 미숙련 시 처리 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrerequisitePolicy {
    /// 선수 토픽이 미숙련이면 계획에서 제외
    Exclude,
    /// 우선순위를 낮추고 선수 토픽 뒤에 배치
    Demote,
}

/// 스케줄러 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 이 점수 미만이면 "미숙련"
    pub mastery_floor: f64,
    /// 숙련 토픽의 감쇠된 confidence가 이 값 미만이면 복습 대상
    pub review_confidence_threshold: f64,
    /// confidence_weight = 1 + review_weight * (1 - confidence)
    pub review_weight: f64,
    pub prerequisite_policy: PrerequisitePolicy,
    /// Demote 정책에서 미숙련 선수 토픽 하나당 감점
    pub prerequisite_penalty: f64,
    pub max_topics_per_week: usize,
    pub min_minutes_per_topic: u32,
    /// 목표 난이도 = score + difficulty_offset (정답률 ~70% 목표)
    pub difficulty_offset: f64,
    pub quiz_cooldown_hours: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mastery_floor: 0.6,
            review_confidence_threshold: 0.4,
            review_weight: 1.0,
            prerequisite_policy: PrerequisitePolicy::Exclude,
            prerequisite_penalty: 0.5,
            max_topics_per_week: 5,
            min_minutes_per_topic: 30,
            difficulty_offset: 0.1,
            quiz_cooldown_hours: 24.0,
        }
    }
}

impl SchedulerConfig {
    pub fn quiz_cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.quiz_cooldown_hours * 3_600_000.0) as i64)
    }
}

/// 외부 호출 재시도 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// 임베딩 프로바이더 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Gemini API (API 키 필요)
    Gemini,
    /// 오프라인 해시 임베딩
    Hashed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingBackend,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::Gemini,
            dimension: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gemini-1.5-flash".to_string(),
            temperature: 0.3,
            max_output_tokens: 2048,
        }
    }
}

impl EngineConfig {
    /// TOML 파일에서 로드
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 데이터 디렉토리의 config.toml을 로드 (없으면 기본값)
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join("config.toml");
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, v: f64) -> Result<()> {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::Config(format!("{} must be in [0, 1], got {}", name, v)));
            }
            Ok(())
        }

        unit("retrieval.relevance_threshold", self.retrieval.relevance_threshold as f64)?;
        unit("mastery.learning_rate", self.mastery.learning_rate)?;
        unit("mastery.confidence_gain", self.mastery.confidence_gain)?;
        unit("mastery.initial_score", self.mastery.initial_score)?;
        unit("mastery.initial_confidence", self.mastery.initial_confidence)?;
        unit("scheduler.mastery_floor", self.scheduler.mastery_floor)?;
        unit("scheduler.review_confidence_threshold", self.scheduler.review_confidence_threshold)?;

        if self.retrieval.default_k == 0 || self.retrieval.candidate_multiplier == 0 {
            return Err(EngineError::Config(
                "retrieval.default_k and candidate_multiplier must be positive".to_string(),
            ));
        }
        let ratio = self.retrieval.dedup_overlap_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(EngineError::Config(format!(
                "retrieval.dedup_overlap_ratio must be in (0, 1], got {}",
                ratio
            )));
        }
        if self.mastery.confidence_half_life_hours <= 0.0 {
            return Err(EngineError::Config(
                "mastery.confidence_half_life_hours must be positive".to_string(),
            ));
        }
        if self.scheduler.max_topics_per_week == 0 {
            return Err(EngineError::Config(
                "scheduler.max_topics_per_week must be positive".to_string(),
            ));
        }
        if self.scheduler.quiz_cooldown_hours < 0.0 || self.scheduler.prerequisite_penalty < 0.0 {
            return Err(EngineError::Config(
                "scheduler cooldown and penalty must not be negative".to_string(),
            ));
        }
        if self.embedding.dimension == 0 {
            return Err(EngineError::Config("embedding.dimension must be positive".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
