//! Mastery 모듈 - 학생별 토픽 숙련도 추적
//!
//! (학생, 토픽) 키마다 독립된 슬롯(`Mutex`)을 두고, 갱신은 슬롯 락 안에서
//! 읽기-수정-쓰기로 수행합니다. 서로 다른 키의 갱신은 서로를 막지 않습니다.
//!
//! 갱신 순서:
//! 1. 문항/토픽 확인 (`NotFound`, `UnknownTopic`)
//! 2. 슬롯 락 획득
//! 3. 새 레코드 계산 (`model::apply_attempt`)
//! 4. 저널 기록 - 실패하면 메모리 상태는 그대로
//! 5. 메모리 반영 (현재값 + 이력)

mod model;

pub use model::{
    apply_attempt, decay_confidence, reinforce_confidence, update_score, AsymmetricWeight,
    DifficultyWeight, MasteryRecord, QuizAttempt, StudentId, UpdateParams,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MasteryConfig;
use crate::curriculum::{CurriculumRegistry, TopicId};
use crate::error::{EngineError, Result};
use crate::quiz::{DifficultyBand, ItemId, QuizBank, QuizItem};

/// 취약 토픽 기준 (미만)
pub const WEAK_THRESHOLD: f64 = 0.5;
/// 강점 토픽 기준 (이상)
pub const STRONG_THRESHOLD: f64 = 0.8;
/// 추천 문구 기준 (이상이면 "Strong")
const RECOMMENDATION_THRESHOLD: f64 = 0.7;

// ============================================================================
// Journal
// ============================================================================

/// 숙련도 변경 기록 (append-only)
pub trait MasteryJournal: Send + Sync {
    /// 시도와 그 결과 레코드를 함께 기록
    fn append_revision(&self, attempt: &QuizAttempt, record: &MasteryRecord) -> Result<()>;
}

/// 기록하지 않는 저널 (메모리 전용 엔진/테스트)
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl MasteryJournal for NullJournal {
    fn append_revision(&self, _attempt: &QuizAttempt, _record: &MasteryRecord) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Report Types
// ============================================================================

/// 토픽별 요약
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicReport {
    pub topic_id: TopicId,
    pub name: String,
    pub score: f64,
    /// 감쇠 적용된 신뢰도
    pub confidence: f64,
    pub attempts: u32,
    /// 다음 퀴즈 권장 난이도 구간
    pub band: DifficultyBand,
    pub recommendation: String,
}

/// 학생 숙련도 리포트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasteryReport {
    pub student_id: StudentId,
    pub topics: Vec<TopicReport>,
    pub weak_topics: Vec<TopicId>,
    pub strong_topics: Vec<TopicId>,
}

/// 채점 결과
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradeReport {
    pub attempts: Vec<QuizAttempt>,
    pub correct: usize,
    pub total: usize,
    /// 시도 적용 후 레코드 (시도 순서)
    pub records: Vec<MasteryRecord>,
}

impl GradeReport {
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

// ============================================================================
// MasteryModel
// ============================================================================

#[derive(Debug, Default)]
struct Slot {
    current: Option<MasteryRecord>,
    history: Vec<MasteryRecord>,
}

type SlotKey = (StudentId, TopicId);

/// 숙련도 모델 (레코드 아레나)
pub struct MasteryModel {
    config: MasteryConfig,
    weight: Arc<dyn DifficultyWeight>,
    curriculum: Arc<CurriculumRegistry>,
    bank: Arc<QuizBank>,
    journal: Arc<dyn MasteryJournal>,
    slots: RwLock<HashMap<SlotKey, Arc<Mutex<Slot>>>>,
    /// (학생, 문항) -> 마지막 정답 시각
    last_correct: Mutex<HashMap<(StudentId, ItemId), DateTime<Utc>>>,
}

impl MasteryModel {
    pub fn new(
        config: MasteryConfig,
        curriculum: Arc<CurriculumRegistry>,
        bank: Arc<QuizBank>,
        journal: Arc<dyn MasteryJournal>,
    ) -> Self {
        Self {
            config,
            weight: Arc::new(AsymmetricWeight),
            curriculum,
            bank,
            journal,
            slots: RwLock::new(HashMap::new()),
            last_correct: Mutex::new(HashMap::new()),
        }
    }

    /// 난이도 가중치 전략 교체
    pub fn with_weight(mut self, weight: Arc<dyn DifficultyWeight>) -> Self {
        self.weight = weight;
        self
    }

    pub fn config(&self) -> &MasteryConfig {
        &self.config
    }

    fn params(&self) -> UpdateParams {
        UpdateParams {
            learning_rate: self.config.learning_rate,
            confidence_gain: self.config.confidence_gain,
            half_life: self.config.half_life(),
        }
    }

    /// 아직 시도가 없는 토픽의 사전 레코드
    pub fn initial_record(&self, student_id: &str, topic_id: &str, at: DateTime<Utc>) -> MasteryRecord {
        MasteryRecord::initial(
            student_id,
            topic_id,
            self.config.initial_score,
            self.config.initial_confidence,
            at,
        )
    }

    fn slot(&self, student_id: &str, topic_id: &str) -> Result<Arc<Mutex<Slot>>> {
        let key = (student_id.to_string(), topic_id.to_string());
        {
            let slots = self.slots.read().map_err(EngineError::lock)?;
            if let Some(slot) = slots.get(&key) {
                return Ok(Arc::clone(slot));
            }
        }
        let mut slots = self.slots.write().map_err(EngineError::lock)?;
        Ok(Arc::clone(slots.entry(key).or_default()))
    }

    fn resolve_item(&self, item_id: &str) -> Result<Arc<QuizItem>> {
        let item = self
            .bank
            .get(item_id)
            .ok_or_else(|| EngineError::not_found("quiz item", item_id))?;
        if !self.curriculum.current().contains(&item.topic_id) {
            return Err(EngineError::UnknownTopic(item.topic_id.clone()));
        }
        Ok(item)
    }

    /// 시도 1회 반영
    ///
    /// 모든 시도는 레코드를 갱신하거나 에러를 반환합니다.
    pub fn record_attempt(&self, attempt: &QuizAttempt) -> Result<MasteryRecord> {
        let item = self.resolve_item(&attempt.item_id)?;
        self.apply(attempt, &item)
    }

    fn apply(&self, attempt: &QuizAttempt, item: &QuizItem) -> Result<MasteryRecord> {
        let slot = self.slot(&attempt.student_id, &item.topic_id)?;
        let mut slot = slot.lock().map_err(EngineError::lock)?;

        let base = match &slot.current {
            Some(record) => record.clone(),
            None => self.initial_record(&attempt.student_id, &item.topic_id, attempt.timestamp),
        };
        let next = apply_attempt(
            &base,
            attempt.correct,
            item.difficulty,
            attempt.timestamp,
            &self.params(),
            self.weight.as_ref(),
        );

        self.journal.append_revision(attempt, &next)?;

        slot.history.push(next.clone());
        slot.current = Some(next.clone());
        drop(slot);

        if attempt.correct {
            let mut last = self.last_correct.lock().map_err(EngineError::lock)?;
            let entry = last
                .entry((attempt.student_id.clone(), attempt.item_id.clone()))
                .or_insert(attempt.timestamp);
            if attempt.timestamp > *entry {
                *entry = attempt.timestamp;
            }
        }

        tracing::debug!(
            "Mastery {}/{}: score={:.3} confidence={:.3} attempts={}",
            next.student_id,
            next.topic_id,
            next.score,
            next.confidence,
            next.attempts
        );
        Ok(next)
    }

    /// 퀴즈 제출 채점
    ///
    /// 모든 문항을 먼저 확인한 뒤 순서대로 적용합니다.
    /// 알 수 없는 문항이 하나라도 있으면 아무 것도 적용하지 않습니다.
    ///
    /// 원자성은 답안 단위입니다. 적용 도중 저널 기록이 실패하면 그 답안과
    /// 이후 답안은 반영되지 않고, 이미 반영된 답안 수를 담은
    /// `PartialGrade`를 돌려줍니다. 호출자는 나머지만 다시 제출하면 됩니다.
    pub fn grade(
        &self,
        student_id: &str,
        answers: &[(ItemId, usize)],
        now: DateTime<Utc>,
    ) -> Result<GradeReport> {
        let items = answers
            .iter()
            .map(|(item_id, _)| self.resolve_item(item_id))
            .collect::<Result<Vec<_>>>()?;

        let mut report = GradeReport {
            attempts: Vec::with_capacity(answers.len()),
            correct: 0,
            total: answers.len(),
            records: Vec::with_capacity(answers.len()),
        };

        for (item, (item_id, chosen)) in items.iter().zip(answers) {
            let attempt = QuizAttempt {
                student_id: student_id.to_string(),
                item_id: item_id.clone(),
                correct: item.is_correct(*chosen),
                timestamp: now,
            };
            let record = match self.apply(&attempt, item) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(
                        "Grading for {} stopped at {}/{}: {}",
                        student_id,
                        report.attempts.len(),
                        report.total,
                        e
                    );
                    return Err(EngineError::PartialGrade {
                        applied: report.attempts.len(),
                        total: report.total,
                        source: Box::new(e),
                    });
                }
            };
            if attempt.correct {
                report.correct += 1;
            }
            report.attempts.push(attempt);
            report.records.push(record);
        }

        tracing::info!(
            "Graded {}/{} correct for student {}",
            report.correct,
            report.total,
            student_id
        );
        Ok(report)
    }

    /// `now` 시점 감쇠를 적용한 학생 스냅샷 (추적 중인 토픽만)
    pub fn snapshot_at(&self, student_id: &str, now: DateTime<Utc>) -> Result<BTreeMap<TopicId, MasteryRecord>> {
        let half_life = self.config.half_life();
        let slots: Vec<Arc<Mutex<Slot>>> = {
            let slots = self.slots.read().map_err(EngineError::lock)?;
            slots
                .iter()
                .filter(|((student, _), _)| student == student_id)
                .map(|(_, slot)| Arc::clone(slot))
                .collect()
        };

        let mut snapshot = BTreeMap::new();
        for slot in slots {
            let slot = slot.lock().map_err(EngineError::lock)?;
            if let Some(record) = &slot.current {
                snapshot.insert(record.topic_id.clone(), record.decayed(now, half_life));
            }
        }
        Ok(snapshot)
    }

    pub fn snapshot(&self, student_id: &str) -> Result<BTreeMap<TopicId, MasteryRecord>> {
        self.snapshot_at(student_id, Utc::now())
    }

    /// 레코드 변경 이력 (오래된 순)
    pub fn history(&self, student_id: &str, topic_id: &str) -> Result<Vec<MasteryRecord>> {
        let key = (student_id.to_string(), topic_id.to_string());
        let slot = match self.slots.read().map_err(EngineError::lock)?.get(&key) {
            Some(slot) => Arc::clone(slot),
            None => return Ok(vec![]),
        };
        let slot = slot.lock().map_err(EngineError::lock)?;
        Ok(slot.history.clone())
    }

    /// 마지막 정답 시각
    pub fn last_correct_at(&self, student_id: &str, item_id: &str) -> Option<DateTime<Utc>> {
        let last = self.last_correct.lock().ok()?;
        last.get(&(student_id.to_string(), item_id.to_string())).copied()
    }

    /// 취약/강점 토픽 리포트
    pub fn report(&self, student_id: &str, now: DateTime<Utc>) -> Result<MasteryReport> {
        let curriculum = self.curriculum.current();
        let snapshot = self.snapshot_at(student_id, now)?;

        let mut report = MasteryReport {
            student_id: student_id.to_string(),
            topics: Vec::with_capacity(snapshot.len()),
            weak_topics: Vec::new(),
            strong_topics: Vec::new(),
        };

        for (topic_id, record) in snapshot {
            if record.score < WEAK_THRESHOLD {
                report.weak_topics.push(topic_id.clone());
            }
            if record.score >= STRONG_THRESHOLD {
                report.strong_topics.push(topic_id.clone());
            }

            let recommendation = if record.score >= RECOMMENDATION_THRESHOLD {
                "Strong"
            } else {
                "Needs practice"
            };

            report.topics.push(TopicReport {
                name: curriculum
                    .topic(&topic_id)
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| topic_id.clone()),
                topic_id,
                score: record.score,
                confidence: record.confidence,
                attempts: record.attempts,
                band: DifficultyBand::from_value(record.score),
                recommendation: recommendation.to_string(),
            });
        }

        Ok(report)
    }

    /// 저장된 상태 복원
    ///
    /// `revisions`는 기록 순서대로여야 하며, 키별 마지막 항목이 현재 레코드가 됩니다.
    pub fn restore(
        &self,
        revisions: Vec<MasteryRecord>,
        last_correct: Vec<(StudentId, ItemId, DateTime<Utc>)>,
    ) -> Result<()> {
        let mut restored = 0;
        {
            let mut slots = self.slots.write().map_err(EngineError::lock)?;
            for record in revisions {
                let key = (record.student_id.clone(), record.topic_id.clone());
                let slot = slots.entry(key).or_default();
                let mut slot = slot.lock().map_err(EngineError::lock)?;
                slot.history.push(record.clone());
                slot.current = Some(record);
                restored += 1;
            }
        }

        let mut last = self.last_correct.lock().map_err(EngineError::lock)?;
        for (student, item, at) in last_correct {
            last.insert((student, item), at);
        }

        tracing::debug!("Restored {} mastery revisions", restored);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::{Curriculum, Topic};
    use crate::quiz::QuizContent;
    use chrono::Duration;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn item(id: &str, topic: &str, difficulty: f64) -> QuizItem {
        QuizItem {
            id: id.to_string(),
            topic_id: topic.to_string(),
            difficulty,
            item: QuizContent {
                question: "Q?".into(),
                options: vec!["a".into(), "b".into()],
                correct_index: 0,
                explanation: String::new(),
            },
        }
    }

    fn model_with(journal: Arc<dyn MasteryJournal>) -> MasteryModel {
        let curriculum = Curriculum::new(
            1,
            vec![Topic::new("T1", "Circuits"), Topic::new("T2", "Signals")],
        )
        .unwrap();
        let bank = QuizBank::new();
        bank.insert(&curriculum, item("easy", "T1", 0.2)).unwrap();
        bank.insert(&curriculum, item("hard", "T1", 0.8)).unwrap();
        bank.insert(&curriculum, item("sig", "T2", 0.5)).unwrap();

        MasteryModel::new(
            MasteryConfig::default(),
            Arc::new(CurriculumRegistry::new(curriculum)),
            Arc::new(bank),
            journal,
        )
    }

    fn model() -> MasteryModel {
        model_with(Arc::new(NullJournal))
    }

    fn attempt(item: &str, correct: bool, at: DateTime<Utc>) -> QuizAttempt {
        QuizAttempt {
            student_id: "s1".into(),
            item_id: item.into(),
            correct,
            timestamp: at,
        }
    }

    struct FailingJournal;

    impl MasteryJournal for FailingJournal {
        fn append_revision(&self, _a: &QuizAttempt, _r: &MasteryRecord) -> Result<()> {
            Err(EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")))
        }
    }

    /// 처음 `remaining`번만 기록에 성공하는 저널
    struct FlakyJournal {
        remaining: Mutex<usize>,
    }

    impl MasteryJournal for FlakyJournal {
        fn append_revision(&self, _a: &QuizAttempt, _r: &MasteryRecord) -> Result<()> {
            let mut remaining = self.remaining.lock().unwrap();
            if *remaining == 0 {
                return Err(EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk full")));
            }
            *remaining -= 1;
            Ok(())
        }
    }

    #[test]
    fn test_first_attempt_creates_record() {
        let m = model();
        let now = ts("2026-03-02T09:00:00Z");
        assert!(m.snapshot_at("s1", now).unwrap().is_empty());

        let record = m.record_attempt(&attempt("hard", true, now)).unwrap();
        assert_eq!(record.topic_id, "T1");
        assert_eq!(record.attempts, 1);
        assert!(record.score > 0.0);
        assert!((record.confidence - 0.25).abs() < 1e-9);

        let snapshot = m.snapshot_at("s1", now).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["T1"], record);
    }

    #[test]
    fn test_unknown_item_is_not_found() {
        let m = model();
        let err = m
            .record_attempt(&attempt("missing", true, ts("2026-03-02T09:00:00Z")))
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "quiz item", .. }));
    }

    #[test]
    fn test_item_for_retired_topic_is_unknown_topic() {
        let curriculum = Curriculum::new(1, vec![Topic::new("T1", "Circuits")]).unwrap();
        let bank = QuizBank::new();
        bank.insert(&curriculum, item("q", "T1", 0.5)).unwrap();
        let registry = Arc::new(CurriculumRegistry::new(curriculum));
        registry.publish(vec![Topic::new("T2", "Signals")]).unwrap();

        let m = MasteryModel::new(MasteryConfig::default(), registry, Arc::new(bank), Arc::new(NullJournal));
        let err = m.record_attempt(&attempt("q", true, ts("2026-03-02T09:00:00Z"))).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTopic(t) if t == "T1"));
    }

    #[test]
    fn test_snapshot_is_idempotent_and_decays_lazily() {
        let m = model();
        let at = ts("2026-03-02T09:00:00Z");
        m.record_attempt(&attempt("easy", true, at)).unwrap();

        let later = at + Duration::hours(336);
        let a = m.snapshot_at("s1", later).unwrap();
        let b = m.snapshot_at("s1", later).unwrap();
        assert_eq!(a, b);
        assert!((a["T1"].confidence - 0.125).abs() < 1e-9);

        // 감쇠는 조회값에만 적용, 저장값은 그대로
        assert!((m.snapshot_at("s1", at).unwrap()["T1"].confidence - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_history_retained() {
        let m = model();
        let at = ts("2026-03-02T09:00:00Z");
        for i in 0..4 {
            m.record_attempt(&attempt("hard", i % 2 == 0, at + Duration::minutes(i))).unwrap();
        }
        let history = m.history("s1", "T1").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().map(|r| r.attempts).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(m.history("s1", "T2").unwrap().is_empty());
    }

    #[test]
    fn test_journal_failure_leaves_record_unchanged() {
        let m = model_with(Arc::new(FailingJournal));
        let at = ts("2026-03-02T09:00:00Z");

        assert!(m.record_attempt(&attempt("hard", true, at)).is_err());
        assert!(m.snapshot_at("s1", at).unwrap().is_empty());
        assert!(m.last_correct_at("s1", "hard").is_none());
    }

    #[test]
    fn test_grade_applies_in_order() {
        let m = model();
        let now = ts("2026-03-02T09:00:00Z");
        let answers = vec![
            ("easy".to_string(), 0),
            ("hard".to_string(), 1),
            ("sig".to_string(), 0),
        ];

        let report = m.grade("s1", &answers, now).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.correct, 2);
        assert_eq!(report.records[1].attempts, 2);
        assert_eq!(m.last_correct_at("s1", "easy"), Some(now));
        assert!(m.last_correct_at("s1", "hard").is_none());
    }

    #[test]
    fn test_grade_with_unknown_item_applies_nothing() {
        let m = model();
        let now = ts("2026-03-02T09:00:00Z");
        let answers = vec![("easy".to_string(), 0), ("nope".to_string(), 0)];

        assert!(m.grade("s1", &answers, now).is_err());
        assert!(m.snapshot_at("s1", now).unwrap().is_empty());
    }

    #[test]
    fn test_report_classifies_topics() {
        let m = model();
        let at = ts("2026-03-02T09:00:00Z");
        for i in 0..30 {
            m.record_attempt(&attempt("hard", true, at + Duration::minutes(i))).unwrap();
        }
        m.record_attempt(&attempt("sig", false, at)).unwrap();

        let report = m.report("s1", at + Duration::hours(1)).unwrap();
        assert_eq!(report.strong_topics, vec!["T1"]);
        assert_eq!(report.weak_topics, vec!["T2"]);

        let t1 = report.topics.iter().find(|t| t.topic_id == "T1").unwrap();
        assert_eq!(t1.recommendation, "Strong");
        assert_eq!(t1.band, DifficultyBand::Hard);
        assert_eq!(t1.name, "Circuits");
    }

    #[test]
    fn test_restore_rehydrates_state() {
        let m = model();
        let at = ts("2026-03-02T09:00:00Z");
        let r1 = MasteryRecord {
            student_id: "s1".into(),
            topic_id: "T1".into(),
            score: 0.3,
            confidence: 0.2,
            attempts: 1,
            last_updated: at,
        };
        let r2 = MasteryRecord {
            score: 0.4,
            attempts: 2,
            ..r1.clone()
        };

        m.restore(vec![r1, r2.clone()], vec![("s1".into(), "easy".into(), at)]).unwrap();

        assert_eq!(m.snapshot_at("s1", at).unwrap()["T1"], r2);
        assert_eq!(m.history("s1", "T1").unwrap().len(), 2);
        assert_eq!(m.last_correct_at("s1", "easy"), Some(at));
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let m = Arc::new(model());
        let at = ts("2026-03-02T09:00:00Z");

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let item = if (t + i) % 2 == 0 { "easy" } else { "hard" };
                        m.record_attempt(&attempt(item, i % 3 != 0, at)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snapshot = m.snapshot_at("s1", at).unwrap();
        assert_eq!(snapshot["T1"].attempts, 400);
        assert_eq!(m.history("s1", "T1").unwrap().len(), 400);
    }

    #[test]
    fn test_journal_failure_mid_submission_reports_applied_prefix() {
        let m = model_with(Arc::new(FlakyJournal {
            remaining: Mutex::new(1),
        }));
        let now = ts("2026-03-02T09:00:00Z");
        let answers = vec![
            ("easy".to_string(), 0),
            ("sig".to_string(), 0),
            ("hard".to_string(), 0),
        ];

        let err = m.grade("s1", &answers, now).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PartialGrade { applied: 1, total: 3, .. }
        ));
        assert!(std::error::Error::source(&err).is_some());

        let snapshot = m.snapshot_at("s1", now).unwrap();
        assert_eq!(snapshot["T1"].attempts, 1);
        assert!(!snapshot.contains_key("T2"));
    }
}
