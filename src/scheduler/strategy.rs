//! 스케줄러 점수 전략
//!
//! 계획 우선순위와 퀴즈 목표 난이도를 교체 가능한 함수 객체로 분리합니다.

use crate::mastery::MasteryRecord;

/// 계획 우선순위 전략
pub trait PriorityStrategy: Send + Sync {
    /// 감쇠 적용된 레코드에 대한 기본 우선순위 (선수 토픽 패널티 제외)
    fn priority(&self, record: &MasteryRecord) -> f64;

    fn name(&self) -> &'static str;
}

/// `(1 - score) * (1 + review_weight * (1 - confidence))`
///
/// 점수가 낮을수록, 감쇠된 신뢰도가 낮을수록 높습니다.
#[derive(Debug, Clone, Copy)]
pub struct MasteryGapPriority {
    pub review_weight: f64,
}

impl PriorityStrategy for MasteryGapPriority {
    fn priority(&self, record: &MasteryRecord) -> f64 {
        let confidence_weight = 1.0 + self.review_weight * (1.0 - record.confidence);
        (1.0 - record.score) * confidence_weight
    }

    fn name(&self) -> &'static str {
        "mastery-gap"
    }
}

/// 퀴즈 목표 난이도 전략
pub trait DifficultyTarget: Send + Sync {
    /// 현재 점수에 대한 목표 난이도 (0.0 ~ 1.0)
    fn target(&self, score: f64) -> f64;

    fn name(&self) -> &'static str;
}

/// 현재 점수보다 조금 높은 난이도 (~70% 정답률 목표)
#[derive(Debug, Clone, Copy)]
pub struct OffsetTarget {
    pub offset: f64,
}

impl DifficultyTarget for OffsetTarget {
    fn target(&self, score: f64) -> f64 {
        (score + self.offset).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "offset"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(score: f64, confidence: f64) -> MasteryRecord {
        MasteryRecord {
            student_id: "s1".into(),
            topic_id: "T1".into(),
            score,
            confidence,
            attempts: 1,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn test_lower_score_higher_priority() {
        let p = MasteryGapPriority { review_weight: 1.0 };
        assert!(p.priority(&record(0.2, 0.5)) > p.priority(&record(0.6, 0.5)));
    }

    #[test]
    fn test_decayed_confidence_raises_priority() {
        let p = MasteryGapPriority { review_weight: 1.0 };
        assert!(p.priority(&record(0.7, 0.1)) > p.priority(&record(0.7, 0.9)));
        assert!((p.priority(&record(0.0, 0.0)) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_offset_target_clamped() {
        let t = OffsetTarget { offset: 0.1 };
        assert!((t.target(0.5) - 0.6).abs() < 1e-9);
        assert_eq!(t.target(0.95), 1.0);
    }
}
