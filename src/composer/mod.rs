//! Answer Composer - 인용 근거 기반 답변 조합
//!
//! 검색기가 돌려준 인용만을 컨텍스트로 언어 모델을 호출하고,
//! 응답이 참조하는 출처가 전부 인용 집합 안에 있는지 검증합니다.
//!
//! 인식하는 참조 형식:
//! - `[S1]` (프롬프트 번호)
//! - `(Source 1)`
//! - `[source: lecture.pdf#0-120]` (출처 이름)

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::knowledge::Citation;
use crate::llm::LanguageModel;
use crate::retry::RetryPolicy;

/// 검증된 답변
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposedAnswer {
    pub text: String,
    /// 답변이 실제로 참조한 인용 (첫 등장 순서, 중복 없음)
    pub citation_refs: Vec<Citation>,
}

// ============================================================================
// Reference Parsing
// ============================================================================

/// 답변 본문에서 찾은 출처 참조
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reference {
    /// 1부터 시작하는 프롬프트 번호
    Numbered { number: usize, raw: String },
    /// 출처 이름 (`doc#start-end` 또는 문서명)
    Named { name: String, raw: String },
}

struct ReferenceParser {
    bracket: Regex,
    parenthesized: Regex,
    named: Regex,
}

impl ReferenceParser {
    fn new() -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EngineError::Config(format!("reference pattern: {}", e)))
        };
        Ok(Self {
            bracket: compile(r"\[S(\d+)\]")?,
            parenthesized: compile(r"(?i)\(source\s+(\d+)\)")?,
            named: compile(r"(?i)\[source:\s*([^\]]+?)\s*\]")?,
        })
    }

    /// 본문 등장 순서대로 참조 추출
    fn parse(&self, text: &str) -> Vec<Reference> {
        let mut found: Vec<(usize, Reference)> = Vec::new();

        for re in [&self.bracket, &self.parenthesized] {
            for caps in re.captures_iter(text) {
                let (Some(whole), Some(num)) = (caps.get(0), caps.get(1)) else {
                    continue;
                };
                // 숫자가 usize 범위를 넘으면 0으로 보고 범위 밖으로 처리
                let number = num.as_str().parse().unwrap_or(0);
                found.push((
                    whole.start(),
                    Reference::Numbered {
                        number,
                        raw: whole.as_str().to_string(),
                    },
                ));
            }
        }

        for caps in self.named.captures_iter(text) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            found.push((
                whole.start(),
                Reference::Named {
                    name: name.as_str().to_string(),
                    raw: whole.as_str().to_string(),
                },
            ));
        }

        found.sort_by_key(|(pos, _)| *pos);
        found.into_iter().map(|(_, r)| r).collect()
    }
}

// ============================================================================
// AnswerComposer
// ============================================================================

/// 답변 조합기
pub struct AnswerComposer {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    parser: ReferenceParser,
}

impl AnswerComposer {
    pub fn new(model: Arc<dyn LanguageModel>, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            model,
            retry,
            parser: ReferenceParser::new()?,
        })
    }

    /// 인용으로 제한된 답변 생성
    ///
    /// 인용이 비어 있으면 모델을 호출하지 않고 `NoGroundingFound`를 반환합니다.
    /// 인용 집합 밖의 출처를 참조하거나 참조가 전혀 없으면 `UngroundedAnswer`.
    pub async fn answer(&self, question: &str, citations: &[Citation]) -> Result<ComposedAnswer> {
        if question.trim().is_empty() {
            return Err(EngineError::InvalidQuery("question is empty".to_string()));
        }
        if citations.is_empty() {
            return Err(EngineError::NoGroundingFound { threshold: 0.0 });
        }

        let prompt_text = build_prompt(question, citations);
        let prompt = prompt_text.as_str();
        let model = Arc::clone(&self.model);
        let text = self
            .retry
            .run("answer generation", || {
                let model = Arc::clone(&model);
                async move { model.generate(prompt).await }
            })
            .await?;

        let citation_refs = match self.validate(&text, citations) {
            Ok(refs) => refs,
            Err(e) => {
                tracing::warn!("Rejected answer from {}: {}", self.model.name(), e);
                return Err(e);
            }
        };

        tracing::debug!(
            "Composed answer citing {}/{} sources",
            citation_refs.len(),
            citations.len()
        );

        Ok(ComposedAnswer {
            text: text.trim().to_string(),
            citation_refs,
        })
    }

    /// 참조 검증 후 실제 사용된 인용 목록 반환
    fn validate(&self, text: &str, citations: &[Citation]) -> Result<Vec<Citation>> {
        let references = self.parser.parse(text);
        if references.is_empty() {
            return Err(EngineError::UngroundedAnswer {
                reference: "<none>".to_string(),
            });
        }

        let mut used: Vec<usize> = Vec::new();
        for reference in references {
            let index = match &reference {
                Reference::Numbered { number, raw } => {
                    if *number == 0 || *number > citations.len() {
                        return Err(EngineError::UngroundedAnswer { reference: raw.clone() });
                    }
                    number - 1
                }
                Reference::Named { name, raw } => citations
                    .iter()
                    .position(|c| {
                        c.source_ref.to_string() == *name || c.source_ref.document == *name
                    })
                    .ok_or_else(|| EngineError::UngroundedAnswer { reference: raw.clone() })?,
            };
            if !used.contains(&index) {
                used.push(index);
            }
        }

        Ok(used.into_iter().map(|i| citations[i].clone()).collect())
    }
}

/// 번호 붙은 컨텍스트 프롬프트
fn build_prompt(question: &str, citations: &[Citation]) -> String {
    let context = citations
        .iter()
        .enumerate()
        .map(|(i, c)| format!("[S{}] ({})\n{}", i + 1, c.source_ref, c.excerpt))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{}\n\nCONTEXT:\n{}\n\nQUESTION:\n{}\n\nANSWER:\n",
        PROMPT_INSTRUCTIONS, context, question
    )
}

const PROMPT_INSTRUCTIONS: &str = r#"You are a course tutor.

INSTRUCTIONS:
- Use ONLY the provided context
- Do NOT add outside knowledge
- If the answer is missing from the context, clearly say so
- Cite every claim inline with its source number, like [S1] or [S2]
- Never cite a source number that is not listed in the context"#;

// ============================================================================
// Tests
// ============================================================================
