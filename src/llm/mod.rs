//! Language Model 모듈 - 외부 텍스트 생성 호출
//!
//! 답변 조합기가 사용하는 `(prompt) -> text` 경계입니다.
//! 실패/타임아웃은 재시도 가능한 `ExternalService` 에러로 보고합니다.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::embedding::{get_api_key, is_retryable_status, GeminiError};
use crate::error::{EngineError, Result};

// ============================================================================
// LanguageModel Trait
// ============================================================================

/// 텍스트 생성 모델 트레이트
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// 프롬프트에 대한 응답 텍스트
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// 모델 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Gemini Implementation
// ============================================================================

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const SERVICE_NAME: &str = "gemini-generate";

/// Google Gemini generateContent 구현체
#[derive(Debug)]
pub struct GeminiModel {
    api_key: String,
    client: reqwest::Client,
    config: LlmConfig,
}

impl GeminiModel {
    pub fn new(api_key: String, config: LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| EngineError::external(SERVICE_NAME, format!("http client: {}", e), false))?;

        Ok(Self {
            api_key,
            client,
            config,
        })
    }

    /// 환경변수의 API 키로 생성
    pub fn from_env(config: LlmConfig) -> Result<Self> {
        Self::new(get_api_key()?, config)
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", GEMINI_API_BASE, self.config.model)
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![GenerateContent {
                parts: vec![TextPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_output_tokens,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
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

        if !status.is_success() {
            let message = match serde_json::from_str::<GeminiError>(&body) {
                Ok(error) => format!("{} ({}): {}", status, error.error.status, error.error.message),
                Err(_) => format!("{}: {}", status, body),
            };
            return Err(EngineError::external(
                SERVICE_NAME,
                message,
                is_retryable_status(status.as_u16()),
            ));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                c.content
                    .parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        // 빈 응답 (안전 필터 등)은 재시도 대상
        if text.trim().is_empty() {
            return Err(EngineError::external(SERVICE_NAME, "empty response", true));
        }

        Ok(text)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<GenerateContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenerateContent {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TextPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: GenerateContent,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_uses_configured_model() {
        let model = GeminiModel::new("fake_key".to_string(), LlmConfig::default()).unwrap();
        assert_eq!(
            model.endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert_eq!(model.name(), "gemini-1.5-flash");
    }

    #[test]
    fn test_request_serialization() {
        let request = GenerateRequest {
            contents: vec![GenerateContent {
                parts: vec![TextPart {
                    text: "hi".to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.3,
                max_output_tokens: 2048,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_response_parsing_joins_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"Ohm "},{"text":"[S1]"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        let parts: Vec<String> = parsed.candidates[0]
            .content
            .parts
            .iter()
            .map(|p| p.text.clone())
            .collect();
        assert_eq!(parts.join(""), "Ohm [S1]");
    }
}
