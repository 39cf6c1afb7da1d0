//! 임베딩 모듈 - 텍스트 벡터화
//!
//! 질문과 강의 자료 청크를 같은 벡터 공간으로 변환합니다.
//! - `GeminiEmbedding`: Gemini API (온라인)
//! - `HashedEmbedding`: 토큰 해시 기반 결정적 임베딩 (오프라인/테스트)
//!
//! 재시도는 여기서 하지 않습니다. 호출 측(`Retriever`, 수집 경로)이
//! `RetryPolicy`로 감쌉니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = GeminiEmbedding::from_env_with_dimension(768)?;
//! let embedding = embedder.embed("What is a Laplace transform?").await?;
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::{EmbeddingBackend, EmbeddingConfig};
use crate::error::{EngineError, Result};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 같은 모델 버전에서 같은 입력은 같은 벡터를 반환한다고 가정합니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Google Gemini Embedding
// ============================================================================

/// Gemini 임베딩 API 엔드포인트
/// source: https://ai.google.dev/gemini-api/docs/embeddings
const GEMINI_EMBED_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-embedding-001:embedContent";

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 768;

/// Rate Limiter 설정 (Gemini 무료 티어: 60 RPM)
const RATE_LIMIT_RPM: u32 = 60;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
/// 호출 간 최소 딜레이
const MIN_DELAY_MS: u64 = 1000;

const SERVICE_NAME: &str = "gemini-embedding";

/// Google Gemini 임베딩 구현체
#[derive(Debug)]
pub struct GeminiEmbedding {
    api_key: String,
    client: reqwest::Client,
    dimension: usize,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

/// 윈도우 기반 Rate Limiter (최소 호출 간격 포함)
#[derive(Debug)]
struct RateLimiter {
    requests: Vec<Instant>,
    max_requests: u32,
    window: Duration,
    min_delay: Duration,
    last_request: Option<Instant>,
}

impl RateLimiter {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Vec::new(),
            max_requests,
            window,
            min_delay: Duration::from_millis(MIN_DELAY_MS),
            last_request: None,
        }
    }

    /// 요청 가능해질 때까지 대기
    async fn acquire(&mut self) {
        if let Some(last) = self.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                let wait_time = self.min_delay - elapsed;
                tracing::debug!("Min delay: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }

        let now = Instant::now();
        self.requests.retain(|&t| now.duration_since(t) < self.window);

        if self.requests.len() >= self.max_requests as usize {
            if let Some(&oldest) = self.requests.first() {
                let wait_time = self.window.saturating_sub(now.duration_since(oldest));
                if !wait_time.is_zero() {
                    tracing::debug!("Rate limit reached, waiting {:?}", wait_time);
                    tokio::time::sleep(wait_time).await;
                }
                let now = Instant::now();
                self.requests.retain(|&t| now.duration_since(t) < self.window);
            }
        }

        let now = Instant::now();
        self.requests.push(now);
        self.last_request = Some(now);
    }
}

impl GeminiEmbedding {
    /// 기본 차원으로 생성
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_dimension(api_key, DEFAULT_DIMENSION)
    }

    /// 차원을 지정하여 생성 (768, 1536, 3072 중 선택)
    pub fn with_dimension(api_key: String, dimension: usize) -> Result<Self> {
        if ![768, 1536, 3072].contains(&dimension) {
            return Err(EngineError::Config(format!(
                "Invalid dimension: {}. Must be 768, 1536, or 3072",
                dimension
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::external(SERVICE_NAME, format!("http client: {}", e), false))?;

        Ok(Self {
            api_key,
            client,
            dimension,
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                RATE_LIMIT_RPM,
                RATE_LIMIT_WINDOW,
            ))),
        })
    }

    /// 환경변수의 API 키로 생성
    pub fn from_env_with_dimension(dimension: usize) -> Result<Self> {
        let api_key = get_api_key()?;
        Self::with_dimension(api_key, dimension)
    }
}

/// Gemini API 요청 본문
#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'static str,
    content: EmbedContent<'a>,
    #[serde(rename = "taskType")]
    task_type: &'static str,
    #[serde(rename = "outputDimensionality")]
    output_dimensionality: usize,
}

#[derive(Debug, Serialize)]
struct EmbedContent<'a> {
    parts: Vec<EmbedPart<'a>>,
}

#[derive(Debug, Serialize)]
struct EmbedPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Gemini API 에러 응답
#[derive(Debug, Deserialize)]
pub(crate) struct GeminiError {
    pub(crate) error: GeminiErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GeminiErrorDetail {
    pub(crate) message: String,
    #[serde(default)]
    pub(crate) status: String,
}

/// HTTP 상태 코드로 재시도 가능 여부 판단 (429, 5xx)
pub(crate) fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[async_trait]
impl EmbeddingProvider for GeminiEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Ok(vec![0.0; self.dimension]);
        }

        let request = EmbedRequest {
            model: "models/gemini-embedding-001",
            content: EmbedContent {
                parts: vec![EmbedPart { text }],
            },
            task_type: "RETRIEVAL_DOCUMENT",
            output_dimensionality: self.dimension,
        };

        {
            let mut limiter = self.rate_limiter.lock().await;
            limiter.acquire().await;
        }

        // API 키는 URL이 아닌 헤더로 전송
        let response = self
            .client
            .post(GEMINI_EMBED_URL)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::external(SERVICE_NAME, format!("request failed: {}", e), true))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::external(SERVICE_NAME, format!("read body: {}", e), true))?;

        if status.is_success() {
            let parsed: EmbedResponse = serde_json::from_str(&body)?;
            if parsed.embedding.values.len() != self.dimension {
                return Err(EngineError::external(
                    SERVICE_NAME,
                    format!(
                        "expected {} dimensions, got {}",
                        self.dimension,
                        parsed.embedding.values.len()
                    ),
                    false,
                ));
            }
            return Ok(parsed.embedding.values);
        }

        let message = match serde_json::from_str::<GeminiError>(&body) {
            Ok(error) => format!("{} ({}): {}", status, error.error.status, error.error.message),
            Err(_) => format!("{}: {}", status, body),
        };
        Err(EngineError::external(
            SERVICE_NAME,
            message,
            is_retryable_status(status.as_u16()),
        ))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "gemini-embedding-001"
    }
}

// ============================================================================
// Hashed Embedding (offline)
// ============================================================================

/// 토큰 해시 기반 임베딩
///
/// 소문자 토큰을 SHA-256으로 버킷에 투영한 뒤 L2 정규화합니다.
/// 의미 유사도는 없지만 어휘가 겹치는 텍스트끼리 코사인 유사도가 높아집니다.
#[derive(Debug, Clone)]
pub struct HashedEmbedding {
    dimension: usize,
}

impl HashedEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() > 1)
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            // 9번째 바이트로 부호 결정 (버킷 충돌 상쇄)
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashedEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "hashed-bow"
    }
}

// ============================================================================
// API Key Management
// ============================================================================

/// API 키 로드 (환경변수에서)
///
/// 우선순위:
/// 1. `GEMINI_API_KEY`
/// 2. `GOOGLE_AI_API_KEY`
pub fn get_api_key() -> Result<String> {
    for var in ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"] {
        if let Ok(key) = std::env::var(var) {
            if !key.is_empty() {
                tracing::debug!("Using API key from {}", var);
                return Ok(key);
            }
        }
    }

    Err(EngineError::Config(
        "API key not found. Set GEMINI_API_KEY or GOOGLE_AI_API_KEY environment variable.\n\
         Get your API key at: https://aistudio.google.com/app/apikey"
            .to_string(),
    ))
}

/// API 키 존재 여부 확인
pub fn has_api_key() -> bool {
    get_api_key().is_ok()
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 따라 임베딩 프로바이더 생성
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider {
        EmbeddingBackend::Gemini => {
            let embedder = GeminiEmbedding::from_env_with_dimension(config.dimension)?;
            tracing::info!("Using Gemini API embedding (dimension: {})", config.dimension);
            Ok(Arc::new(embedder))
        }
        EmbeddingBackend::Hashed => {
            tracing::info!("Using offline hashed embedding (dimension: {})", config.dimension);
            Ok(Arc::new(HashedEmbedding::new(config.dimension)))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::cosine_similarity;

    #[test]
    fn test_invalid_dimension() {
        let result = GeminiEmbedding::with_dimension("fake_key".to_string(), 999);
        assert!(matches!(result, Err(EngineError::Config(msg)) if msg.contains("Invalid dimension")));
    }

    #[test]
    fn test_valid_dimensions() {
        for dim in [768, 1536, 3072] {
            assert!(GeminiEmbedding::with_dimension("fake_key".to_string(), dim).is_ok());
        }
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(403));
    }

    #[tokio::test]
    async fn test_hashed_embedding_is_deterministic() {
        let embedder = HashedEmbedding::new(64);
        let a = embedder.embed("Fourier series converge").await.unwrap();
        let b = embedder.embed("Fourier series converge").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_hashed_embedding_overlap_scores_higher() {
        let embedder = HashedEmbedding::new(256);
        let q = embedder.embed("laplace transform of a step function").await.unwrap();
        let near = embedder.embed("The Laplace transform turns a step function into 1/s").await.unwrap();
        let far = embedder.embed("Ohm's law relates voltage and current").await.unwrap();

        assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
    }

    #[tokio::test]
    async fn test_hashed_embedding_blank_text_is_zero_vector() {
        let embedder = HashedEmbedding::new(8);
        let v = embedder.embed("   ").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }
}
