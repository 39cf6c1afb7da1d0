//! 숙련도 갱신 규칙 (순수 함수)
//!
//! - 점수: `new = clamp(old + lr * (outcome - old) * w(difficulty), 0, 1)`
//! - 신뢰도 강화: `c += (1 - c) * gain`
//! - 신뢰도 감쇠: `c * 0.5^(elapsed / half_life)` - 조회 시점에 계산
//!
//! 시계나 락에 의존하지 않으므로 같은 입력이면 항상 같은 결과입니다.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::curriculum::TopicId;

/// 학생 ID
pub type StudentId = String;

// ============================================================================
// Types
// ============================================================================

/// (학생, 토픽)별 숙련도 레코드
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasteryRecord {
    pub student_id: StudentId,
    pub topic_id: TopicId,
    /// 숙련도 (0.0 ~ 1.0)
    pub score: f64,
    /// 신뢰도 (0.0 ~ 1.0), 저장값은 `last_updated` 시점 기준
    pub confidence: f64,
    /// 반영된 시도 수
    pub attempts: u32,
    pub last_updated: DateTime<Utc>,
}

impl MasteryRecord {
    /// 첫 시도 전 사전값
    pub fn initial(
        student_id: impl Into<String>,
        topic_id: impl Into<String>,
        score: f64,
        confidence: f64,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            student_id: student_id.into(),
            topic_id: topic_id.into(),
            score: clamp_unit(score),
            confidence: clamp_unit(confidence),
            attempts: 0,
            last_updated: at,
        }
    }

    /// `now` 시점으로 신뢰도 감쇠를 적용한 사본
    pub fn decayed(&self, now: DateTime<Utc>, half_life: Duration) -> Self {
        Self {
            confidence: decay_confidence(self.confidence, now - self.last_updated, half_life),
            ..self.clone()
        }
    }
}

/// 퀴즈 시도 (숙련도 갱신의 유일한 트리거)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizAttempt {
    pub student_id: StudentId,
    pub item_id: String,
    pub correct: bool,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Difficulty Weight
// ============================================================================

/// 난이도 가중치 전략
pub trait DifficultyWeight: Send + Sync {
    /// 갱신 폭에 곱해지는 가중치 (양수)
    fn weight(&self, difficulty: f64, correct: bool) -> f64;

    fn name(&self) -> &'static str;
}

/// 비대칭 가중치
///
/// 정답: `0.5 + d` (어려운 문항일수록 크게 상승)
/// 오답: `1.5 - d` (쉬운 문항일수록 크게 하락)
#[derive(Debug, Clone, Copy, Default)]
pub struct AsymmetricWeight;

impl DifficultyWeight for AsymmetricWeight {
    fn weight(&self, difficulty: f64, correct: bool) -> f64 {
        let d = clamp_unit(difficulty);
        if correct {
            0.5 + d
        } else {
            1.5 - d
        }
    }

    fn name(&self) -> &'static str {
        "asymmetric"
    }
}

// ============================================================================
// Update Rules
// ============================================================================

/// 갱신 파라미터
#[derive(Debug, Clone, Copy)]
pub struct UpdateParams {
    pub learning_rate: f64,
    pub confidence_gain: f64,
    pub half_life: Duration,
}

/// 점수 갱신
pub fn update_score(
    old: f64,
    correct: bool,
    difficulty: f64,
    learning_rate: f64,
    weight: &dyn DifficultyWeight,
) -> f64 {
    let outcome = if correct { 1.0 } else { 0.0 };
    let w = weight.weight(difficulty, correct);
    clamp_unit(old + learning_rate * (outcome - old) * w)
}

/// 시도 1회에 따른 신뢰도 강화 (체감)
pub fn reinforce_confidence(confidence: f64, gain: f64) -> f64 {
    let c = clamp_unit(confidence);
    clamp_unit(c + (1.0 - c) * clamp_unit(gain))
}

/// 반감기 기반 신뢰도 감쇠
///
/// 경과 시간이 음수면(시계 역행) 감쇠 없음. 반감기가 0 이하면 감쇠 없음.
pub fn decay_confidence(confidence: f64, elapsed: Duration, half_life: Duration) -> f64 {
    let c = clamp_unit(confidence);
    let half_life_secs = half_life.num_milliseconds() as f64 / 1000.0;
    let elapsed_secs = elapsed.num_milliseconds() as f64 / 1000.0;
    if half_life_secs <= 0.0 || elapsed_secs <= 0.0 {
        return c;
    }
    clamp_unit(c * 0.5f64.powf(elapsed_secs / half_life_secs))
}

/// 레코드에 시도 1회 적용
///
/// 신뢰도는 시도 시점까지 감쇠시킨 뒤 강화합니다.
/// 시도가 마지막 갱신보다 이전 시각이면 `last_updated`는 유지됩니다.
pub fn apply_attempt(
    record: &MasteryRecord,
    correct: bool,
    difficulty: f64,
    at: DateTime<Utc>,
    params: &UpdateParams,
    weight: &dyn DifficultyWeight,
) -> MasteryRecord {
    let decayed = decay_confidence(record.confidence, at - record.last_updated, params.half_life);

    MasteryRecord {
        student_id: record.student_id.clone(),
        topic_id: record.topic_id.clone(),
        score: update_score(record.score, correct, difficulty, params.learning_rate, weight),
        confidence: reinforce_confidence(decayed, params.confidence_gain),
        attempts: record.attempts.saturating_add(1),
        last_updated: at.max(record.last_updated),
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params() -> UpdateParams {
        UpdateParams {
            learning_rate: 0.2,
            confidence_gain: 0.25,
            half_life: Duration::hours(336),
        }
    }

    fn record(score: f64, confidence: f64) -> MasteryRecord {
        let at = DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        MasteryRecord {
            student_id: "s1".into(),
            topic_id: "T1".into(),
            score,
            confidence,
            attempts: 3,
            last_updated: at,
        }
    }

    #[test]
    fn test_correct_hard_item_raises_score() {
        let r = record(0.5, 0.5);
        let next = apply_attempt(&r, true, 0.8, r.last_updated, &params(), &AsymmetricWeight);

        // 0.5 + 0.2 * 0.5 * 1.3
        assert!((next.score - 0.63).abs() < 1e-9);
        assert!(next.score > 0.5);
        assert_eq!(next.attempts, 4);
    }

    #[test]
    fn test_wrong_easy_item_penalized_more_than_wrong_hard_item() {
        let easy = update_score(0.5, false, 0.2, 0.2, &AsymmetricWeight);
        let hard = update_score(0.5, false, 0.8, 0.2, &AsymmetricWeight);

        assert!(easy < hard);
        assert!(hard < 0.5);
        assert!((easy - 0.37).abs() < 1e-9);
        assert!((hard - 0.43).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_diminishing_returns() {
        let c1 = reinforce_confidence(0.0, 0.25);
        let c2 = reinforce_confidence(c1, 0.25);
        assert!((c1 - 0.25).abs() < 1e-9);
        assert!(c2 - c1 < c1);
    }

    #[test]
    fn test_decay_half_life() {
        let half = decay_confidence(0.8, Duration::hours(336), Duration::hours(336));
        assert!((half - 0.4).abs() < 1e-9);

        assert_eq!(decay_confidence(0.8, Duration::zero(), Duration::hours(336)), 0.8);
        assert_eq!(decay_confidence(0.8, Duration::hours(-5), Duration::hours(336)), 0.8);
    }

    #[test]
    fn test_decay_is_pure() {
        let r = record(0.7, 0.9);
        let now = r.last_updated + Duration::days(10);
        assert_eq!(r.decayed(now, params().half_life), r.decayed(now, params().half_life));
        assert_eq!(r.decayed(now, params().half_life).score, 0.7);
    }

    #[test]
    fn test_out_of_order_attempt_keeps_last_updated() {
        let r = record(0.5, 0.5);
        let earlier = r.last_updated - Duration::hours(1);
        let next = apply_attempt(&r, true, 0.5, earlier, &params(), &AsymmetricWeight);
        assert_eq!(next.last_updated, r.last_updated);
    }

    #[test]
    fn test_weight_is_monotonic_in_difficulty() {
        let w = AsymmetricWeight;
        assert!(w.weight(0.9, true) > w.weight(0.1, true));
        assert!(w.weight(0.1, false) > w.weight(0.9, false));
    }

    proptest! {
        #[test]
        fn prop_score_and_confidence_stay_in_unit_interval(
            score in 0.0f64..=1.0,
            confidence in 0.0f64..=1.0,
            attempts in prop::collection::vec((any::<bool>(), 0.0f64..=1.0, 0i64..2000), 1..60),
            learning_rate in 0.0f64..=1.0,
        ) {
            let p = UpdateParams { learning_rate, ..params() };
            let mut r = record(score, confidence);
            for (correct, difficulty, hours) in attempts {
                let at = r.last_updated + Duration::hours(hours);
                r = apply_attempt(&r, correct, difficulty, at, &p, &AsymmetricWeight);
                prop_assert!((0.0..=1.0).contains(&r.score));
                prop_assert!((0.0..=1.0).contains(&r.confidence));
            }
            let later = r.decayed(r.last_updated + Duration::days(400), p.half_life);
            prop_assert!((0.0..=1.0).contains(&later.confidence));
        }
    }
}
