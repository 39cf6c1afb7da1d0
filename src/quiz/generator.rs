//! Quiz Generator - 수집된 자료로 객관식 문항 생성
//!
//! 토픽 이름으로 근거 청크를 검색해 언어 모델에 넘기고, JSON 응답을
//! 검증된 `QuizItem`으로 변환합니다. 근거가 없으면 생성하지 않습니다.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::curriculum::Topic;
use crate::error::{EngineError, Result};
use crate::knowledge::{Citation, Retriever};
use crate::llm::LanguageModel;
use crate::retry::RetryPolicy;

use super::{DifficultyBand, QuizContent, QuizItem};

/// 프롬프트에 넣는 최대 발췌 수
const MAX_EXCERPTS: usize = 3;
/// 발췌당 최대 글자 수
const MAX_EXCERPT_CHARS: usize = 800;
/// 생성 문항의 보기 수
const OPTION_COUNT: usize = 4;

// ============================================================================
// Response Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct GeneratedQuiz {
    #[serde(default)]
    questions: Vec<GeneratedQuestion>,
}

#[derive(Debug, Deserialize)]
struct GeneratedQuestion {
    question: String,
    options: Vec<String>,
    correct_index: usize,
    #[serde(default)]
    explanation: String,
}

struct ResponseParser {
    fence: Regex,
    placeholder: Regex,
}

impl ResponseParser {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EngineError::Config(format!("quiz pattern: {}", e)))
        };
        Ok(Self {
            fence: compile(r"(?s)```(?:json)?\s*(.*?)```")?,
            placeholder: compile(r"(?i)^(concept|option|choice)\s*[a-d1-4]$")?,
        })
    }

    /// 코드 펜스를 벗기고 첫 `{`부터 마지막 `}`까지 파싱
    fn parse(&self, text: &str) -> Result<GeneratedQuiz> {
        let body = self
            .fence
            .captures(text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .unwrap_or(text);

        let json = match (body.find('{'), body.rfind('}')) {
            (Some(start), Some(end)) if start < end => &body[start..=end],
            _ => {
                return Err(EngineError::external(
                    "quiz generator",
                    "response contains no JSON object",
                    true,
                ))
            }
        };

        serde_json::from_str(json).map_err(|e| {
            EngineError::external("quiz generator", format!("malformed quiz JSON: {}", e), true)
        })
    }

    fn is_placeholder(&self, option: &str) -> bool {
        let option = option.trim();
        option.is_empty() || self.placeholder.is_match(option)
    }
}

// ============================================================================
// QuizGenerator
// ============================================================================

/// 근거 기반 문항 생성기
pub struct QuizGenerator {
    model: Arc<dyn LanguageModel>,
    retriever: Arc<Retriever>,
    retry: RetryPolicy,
    parser: ResponseParser,
}

impl QuizGenerator {
    pub fn new(model: Arc<dyn LanguageModel>, retriever: Arc<Retriever>, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            model,
            retriever,
            retry,
            parser: ResponseParser::new()?,
        })
    }

    /// 토픽 자료로 최대 `n`개 문항 생성
    ///
    /// 근거 청크가 없으면 `NoGroundingFound`. 응답을 파싱할 수 없거나 쓸 만한
    /// 문항이 하나도 없으면 재시도 후 `ExternalService`.
    pub async fn generate(&self, topic: &Topic, band: DifficultyBand, n: usize) -> Result<Vec<QuizItem>> {
        if n == 0 {
            return Err(EngineError::InvalidQuery("n must be positive".to_string()));
        }

        let citations = self
            .retriever
            .retrieve(&topic.name, Some(&topic.id), MAX_EXCERPTS)
            .await?;

        let prompt_text = build_prompt(topic, band, n, &citations);
        let prompt = prompt_text.as_str();
        let model = Arc::clone(&self.model);
        let parser = &self.parser;

        let items = self
            .retry
            .run("quiz generation", || {
                let model = Arc::clone(&model);
                async move {
                    let text = model.generate(prompt).await?;
                    let parsed = parser.parse(&text)?;
                    let items = self.convert(topic, band, parsed);
                    if items.is_empty() {
                        return Err(EngineError::external(
                            "quiz generator",
                            "no usable questions in response",
                            true,
                        ));
                    }
                    Ok(items)
                }
            })
            .await?;

        let items: Vec<QuizItem> = items.into_iter().take(n).collect();
        tracing::info!(
            "Generated {} {} questions for {} from {} excerpts",
            items.len(),
            band,
            topic.id,
            citations.len()
        );
        Ok(items)
    }

    /// 검증을 통과한 문항만 변환 (ID 중복 제거)
    fn convert(&self, topic: &Topic, band: DifficultyBand, parsed: GeneratedQuiz) -> Vec<QuizItem> {
        let mut items: Vec<QuizItem> = Vec::new();

        for q in parsed.questions {
            if q.options.len() != OPTION_COUNT || q.options.iter().any(|o| self.parser.is_placeholder(o)) {
                tracing::debug!("Skipping generated question with unusable options: {}", q.question);
                continue;
            }

            let item = QuizItem {
                id: item_id(&topic.id, &q.question),
                topic_id: topic.id.clone(),
                difficulty: band.midpoint(),
                item: QuizContent {
                    question: q.question.trim().to_string(),
                    options: q.options.iter().map(|o| o.trim().to_string()).collect(),
                    correct_index: q.correct_index,
                    explanation: q.explanation.trim().to_string(),
                },
            };

            if let Err(e) = item.validate() {
                tracing::debug!("Skipping generated question: {}", e);
                continue;
            }
            if items.iter().any(|i| i.id == item.id) {
                continue;
            }
            items.push(item);
        }

        items
    }
}

/// `{topic}-{sha256(question) 앞 12자리}`
fn item_id(topic_id: &str, question: &str) -> String {
    let digest = Sha256::digest(question.trim().as_bytes());
    let hex: String = digest[..6].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", topic_id, hex)
}

fn build_prompt(topic: &Topic, band: DifficultyBand, n: usize, citations: &[Citation]) -> String {
    let context = citations
        .iter()
        .take(MAX_EXCERPTS)
        .enumerate()
        .map(|(i, c)| {
            let excerpt: String = c.excerpt.chars().take(MAX_EXCERPT_CHARS).collect();
            format!("[S{}] ({})\n{}", i + 1, c.source_ref, excerpt)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{}\n\nTOPIC: {}\nDIFFICULTY: {}\nNUMBER OF QUESTIONS: {}\n\nCONTEXT:\n{}\n\nJSON:\n",
        PROMPT_INSTRUCTIONS, topic.name, band, n, context
    )
}

const PROMPT_INSTRUCTIONS: &str = r#"You write multiple-choice quiz questions for a course.

INSTRUCTIONS:
- Use ONLY facts stated in the provided context
- Each question has exactly 4 specific options, never placeholders like "Option A"
- correct_index is the 0-based index of the correct option
- Reply with JSON only, in this shape:
{"topic": "...", "difficulty_level": "...", "questions": [{"question": "...", "options": ["...", "...", "...", "..."], "correct_index": 0, "explanation": "..."}]}"#;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::embedding::{EmbeddingProvider, HashedEmbedding};
    use crate::knowledge::{Chunk, EmbeddingIndex, MemoryIndex, SourceRef};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// 미리 정한 응답을 순서대로 돌려주는 모델
    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
        calls: AtomicUsize,
        last_prompt: Mutex<String>,
    }

    impl ScriptedModel {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = prompt.to_string();
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| EngineError::external("scripted", "exhausted", false))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    const GOOD: &str = r#"Here you go:
```json
{"topic": "Circuits", "difficulty_level": "easy", "questions": [
  {"question": "What does Ohm's law relate?", "options": ["Voltage, current and resistance", "Mass and energy", "Charge and time", "Heat and work"], "correct_index": 0, "explanation": "V = IR"},
  {"question": "Placeholder question?", "options": ["Option A", "Option B", "Option C", "Option D"], "correct_index": 1},
  {"question": "Out of range?", "options": ["a1", "b1", "c1", "d1"], "correct_index": 7}
]}
```"#;

    fn topic() -> Topic {
        Topic::new("circuits", "Circuits")
    }

    async fn grounded_retriever(with_content: bool) -> Arc<Retriever> {
        let embedder = Arc::new(HashedEmbedding::new(64));
        let index = Arc::new(MemoryIndex::new());
        if with_content {
            let text = "Circuits";
            let embedding = embedder.embed(text).await.unwrap();
            index
                .upsert(Chunk::new("circuits", text, embedding, SourceRef::new("ohm.pdf", 0, 8)))
                .unwrap();
        }
        Arc::new(Retriever::new(
            index,
            embedder,
            RetryPolicy::none(),
            RetrievalConfig::default(),
        ))
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[tokio::test]
    async fn test_generates_only_valid_questions() {
        let model = ScriptedModel::new(&[GOOD]);
        let generator = QuizGenerator::new(model.clone(), grounded_retriever(true).await, fast_retry(0)).unwrap();

        let items = generator.generate(&topic(), DifficultyBand::Easy, 5).await.unwrap();

        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert!(item.id.starts_with("circuits-"));
        assert_eq!(item.id.len(), "circuits-".len() + 12);
        assert_eq!(item.topic_id, "circuits");
        assert_eq!(item.band(), DifficultyBand::Easy);
        assert_eq!(item.item.explanation, "V = IR");

        let prompt = model.last_prompt.lock().unwrap().clone();
        assert!(prompt.contains("[S1] (ohm.pdf#0-8)"));
        assert!(prompt.contains("DIFFICULTY: easy"));
    }

    #[tokio::test]
    async fn test_malformed_response_is_retried() {
        let model = ScriptedModel::new(&["not json at all", GOOD]);
        let generator = QuizGenerator::new(model.clone(), grounded_retriever(true).await, fast_retry(2)).unwrap();

        let items = generator.generate(&topic(), DifficultyBand::Medium, 1).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_usable_questions_is_external_error() {
        let only_placeholders = r#"{"questions": [{"question": "Q?", "options": ["Concept A", "Concept B", "Concept C", "Concept D"], "correct_index": 0}]}"#;
        let model = ScriptedModel::new(&[only_placeholders]);
        let generator = QuizGenerator::new(model, grounded_retriever(true).await, fast_retry(0)).unwrap();

        let err = generator.generate(&topic(), DifficultyBand::Hard, 3).await.unwrap_err();
        assert!(matches!(err, EngineError::ExternalService { .. }));
    }

    #[tokio::test]
    async fn test_without_material_model_is_not_called() {
        let model = ScriptedModel::new(&[GOOD]);
        let generator = QuizGenerator::new(model.clone(), grounded_retriever(false).await, fast_retry(0)).unwrap();

        let err = generator.generate(&topic(), DifficultyBand::Easy, 3).await.unwrap_err();
        assert!(matches!(err, EngineError::NoGroundingFound { .. }));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);

        assert!(matches!(
            generator.generate(&topic(), DifficultyBand::Easy, 0).await,
            Err(EngineError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_item_id_is_stable() {
        assert_eq!(item_id("t", "What?"), item_id("t", "  What? "));
        assert_ne!(item_id("t", "What?"), item_id("u", "What?"));
    }
}
