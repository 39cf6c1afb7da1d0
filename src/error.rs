//! 엔진 에러 타입
//!
//! 검색, 숙련도, 스케줄러, 답변 조합 전 구간에서 공유하는 에러 분류입니다.
//! CLI 계층은 `anyhow`로 감싸서 사용합니다.

use thiserror::Error;

/// 엔진 Result 별칭
pub type Result<T> = std::result::Result<T, EngineError>;

/// 적응형 학습 엔진 에러
#[derive(Debug, Error)]
pub enum EngineError {
    /// 존재하지 않는 엔티티 참조 (청크, 퀴즈 문항 등)
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// 잘못된 입력 (벡터 차원 불일치, 빈 질문, k = 0 등)
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// 임계값 이상의 근거 청크가 없음 - 시스템 실패가 아닌 정상 종료 결과
    #[error("no grounding passage found above relevance threshold {threshold}")]
    NoGroundingFound { threshold: f32 },

    /// 커리큘럼에 없는 토픽
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// 요청한 수보다 퀴즈 문항이 적음
    #[error("insufficient content for topic {topic_id}: requested {requested}, available {available}")]
    InsufficientContent {
        topic_id: String,
        requested: usize,
        available: usize,
    },

    /// 제공된 인용 집합에 없는 출처를 참조한 답변
    #[error("ungrounded answer: reference {reference} is not in the supplied citations")]
    UngroundedAnswer { reference: String },

    /// 임베딩/LLM 외부 호출 실패
    #[error("{service} failed: {message}")]
    ExternalService {
        service: String,
        message: String,
        retryable: bool,
    },

    /// 커리큘럼 DAG 검증 실패 (순환, 누락된 선수 토픽, 중복 ID)
    #[error("invalid curriculum: {0}")]
    InvalidCurriculum(String),

    /// 채점 도중 기록 실패 - 앞의 `applied`개 답안은 이미 반영되어 저장됨
    #[error("grading stopped after {applied}/{total} answers: {source}")]
    PartialGrade {
        applied: usize,
        total: usize,
        #[source]
        source: Box<EngineError>,
    },

    /// 계획 생성 취소됨 (아무것도 저장되지 않음)
    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// 재시도 가능한 외부 장애인지 여부
    ///
    /// `NoGroundingFound`, `InsufficientContent`는 재시도해도 결과가 바뀌지 않으므로 false.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ExternalService { retryable: true, .. })
    }

    pub(crate) fn external(service: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        EngineError::ExternalService {
            service: service.into(),
            message: message.into(),
            retryable,
        }
    }

    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    /// 락 poisoning을 스토리지 계층 에러로 변환
    pub(crate) fn lock<E: std::fmt::Display>(e: E) -> Self {
        EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Lock error: {}", e),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_retryable_external_errors_are_retried() {
        assert!(EngineError::external("gemini", "429", true).is_retryable());
        assert!(!EngineError::external("gemini", "bad key", false).is_retryable());
        assert!(!EngineError::NoGroundingFound { threshold: 0.5 }.is_retryable());
        assert!(!EngineError::InsufficientContent {
            topic_id: "t".into(),
            requested: 5,
            available: 2,
        }
        .is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::not_found("chunk", "abc");
        assert_eq!(err.to_string(), "chunk not found: abc");

        let err = EngineError::UngroundedAnswer { reference: "[S9]".into() };
        assert!(err.to_string().contains("[S9]"));
    }
}
