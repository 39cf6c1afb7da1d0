//! Scheduler 모듈 - 주간 학습 계획과 적응형 퀴즈 선택
//!
//! 계획 생성:
//! 1. 숙련도 스냅샷 (감쇠 적용)
//! 2. 후보 선정 - 미숙련 토픽 + 신뢰도가 떨어진 숙련 토픽(review)
//! 3. 선수 토픽 정책 (exclude / demote)
//! 4. 우선순위 순 탐욕 선택 - 미숙련 선수 토픽이 먼저 선택된 경우에만 선택
//! 5. 최소 할당 + 우선순위 비례 분배 (최대 잉여 반올림, 합계 = 예산)
//! 6. 취소되지 않았으면 한 번에 커밋
//!
//! 계획은 매번 새로 만들며 이전 계획은 이력으로 남습니다.

mod strategy;

pub use strategy::{DifficultyTarget, MasteryGapPriority, OffsetTarget, PriorityStrategy};

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{PrerequisitePolicy, SchedulerConfig};
use crate::curriculum::{CurriculumRegistry, TopicId};
use crate::error::{EngineError, Result};
use crate::mastery::{MasteryModel, MasteryRecord, StudentId};
use crate::quiz::{ItemId, QuizBank, QuizItem};

// ============================================================================
// Plan Types
// ============================================================================

/// 계획 항목
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub topic_id: TopicId,
    pub allocated_minutes: u32,
    pub priority: f64,
    /// 이미 숙련했지만 신뢰도가 떨어져 복습하는 토픽
    pub review: bool,
}

/// 주간 학습 계획
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyPlan {
    pub id: Uuid,
    pub student_id: StudentId,
    /// 주 시작일 (월요일)
    pub week_start: NaiveDate,
    pub generated_at: DateTime<Utc>,
    pub budget_minutes: u32,
    pub curriculum_version: u64,
    /// 학습 순서대로 정렬된 항목
    pub entries: Vec<PlanEntry>,
}

impl StudyPlan {
    pub fn total_minutes(&self) -> u32 {
        self.entries.iter().map(|e| e.allocated_minutes).sum()
    }
}

/// 해당 시각이 속한 주의 월요일
pub fn week_start(at: DateTime<Utc>) -> NaiveDate {
    let date = at.date_naive();
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

// ============================================================================
// Plan Sink
// ============================================================================

/// 계획 저장소 (all-or-nothing append)
pub trait PlanSink: Send + Sync {
    fn append(&self, plan: &StudyPlan) -> Result<()>;

    /// 학생 계획 이력 (오래된 순)
    fn history(&self, student_id: &str) -> Result<Vec<StudyPlan>>;
}

/// 메모리 계획 이력
#[derive(Debug, Default)]
pub struct MemoryPlanHistory {
    plans: Mutex<Vec<StudyPlan>>,
}

impl MemoryPlanHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlanSink for MemoryPlanHistory {
    fn append(&self, plan: &StudyPlan) -> Result<()> {
        self.plans.lock().map_err(EngineError::lock)?.push(plan.clone());
        Ok(())
    }

    fn history(&self, student_id: &str) -> Result<Vec<StudyPlan>> {
        let plans = self.plans.lock().map_err(EngineError::lock)?;
        Ok(plans.iter().filter(|p| p.student_id == student_id).cloned().collect())
    }
}

// ============================================================================
// Quiz Types
// ============================================================================

/// 요청보다 적은 문항 (채우지 않고 보고만 함)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub topic_id: TopicId,
    pub requested: usize,
    pub available: usize,
}

impl From<Shortfall> for EngineError {
    fn from(s: Shortfall) -> Self {
        EngineError::InsufficientContent {
            topic_id: s.topic_id,
            requested: s.requested,
            available: s.available,
        }
    }
}

/// 퀴즈 선택 결과
#[derive(Debug, Clone)]
pub struct QuizSelection {
    pub items: Vec<Arc<QuizItem>>,
    pub target_difficulty: f64,
    pub shortfall: Option<Shortfall>,
}

impl QuizSelection {
    /// 부족분이 있으면 `InsufficientContent` 에러로 변환
    pub fn into_strict(self) -> Result<Vec<Arc<QuizItem>>> {
        match self.shortfall {
            Some(shortfall) => Err(shortfall.into()),
            None => Ok(self.items),
        }
    }
}

/// 한 세션에서 이미 출제한 문항 (비복원 추출)
#[derive(Debug, Clone, Default)]
pub struct QuizSession {
    student_id: StudentId,
    served: HashSet<ItemId>,
}

impl QuizSession {
    pub fn new(student_id: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            served: HashSet::new(),
        }
    }

    pub fn student_id(&self) -> &str {
        &self.student_id
    }

    pub fn served(&self) -> usize {
        self.served.len()
    }

    pub fn has_served(&self, item_id: &str) -> bool {
        self.served.contains(item_id)
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// 후보 토픽
#[derive(Debug, Clone)]
struct Candidate {
    topic_id: TopicId,
    priority: f64,
    review: bool,
    /// 미숙련 선수 토픽
    pending_prerequisites: Vec<TopicId>,
}

/// 학습 계획/퀴즈 스케줄러
pub struct Scheduler {
    config: SchedulerConfig,
    curriculum: Arc<CurriculumRegistry>,
    mastery: Arc<MasteryModel>,
    bank: Arc<QuizBank>,
    sink: Arc<dyn PlanSink>,
    priority: Arc<dyn PriorityStrategy>,
    target: Arc<dyn DifficultyTarget>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        curriculum: Arc<CurriculumRegistry>,
        mastery: Arc<MasteryModel>,
        bank: Arc<QuizBank>,
        sink: Arc<dyn PlanSink>,
    ) -> Self {
        let priority = Arc::new(MasteryGapPriority {
            review_weight: config.review_weight,
        });
        let target = Arc::new(OffsetTarget {
            offset: config.difficulty_offset,
        });
        Self {
            config,
            curriculum,
            mastery,
            bank,
            sink,
            priority,
            target,
        }
    }

    pub fn with_priority(mut self, priority: Arc<dyn PriorityStrategy>) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_target(mut self, target: Arc<dyn DifficultyTarget>) -> Self {
        self.target = target;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// 계획 이력
    pub fn plan_history(&self, student_id: &str) -> Result<Vec<StudyPlan>> {
        self.sink.history(student_id)
    }

    /// 주간 계획 생성 후 커밋
    pub fn generate_plan(&self, student_id: &str, budget_minutes: u32, now: DateTime<Utc>) -> Result<StudyPlan> {
        self.generate_plan_cancellable(student_id, budget_minutes, now, &CancellationToken::new())
    }

    /// 취소 가능한 계획 생성
    ///
    /// 커밋 전에 취소되면 `Cancelled`를 반환하고 아무 것도 저장하지 않습니다.
    pub fn generate_plan_cancellable(
        &self,
        student_id: &str,
        budget_minutes: u32,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<StudyPlan> {
        let check = || {
            if cancel.is_cancelled() {
                tracing::info!("Plan generation cancelled for {}", student_id);
                Err(EngineError::Cancelled)
            } else {
                Ok(())
            }
        };

        let curriculum = self.curriculum.current();
        let snapshot = self.mastery.snapshot_at(student_id, now)?;
        check()?;

        let record_of = |topic_id: &str| -> MasteryRecord {
            snapshot
                .get(topic_id)
                .cloned()
                .unwrap_or_else(|| self.mastery.initial_record(student_id, topic_id, now))
        };
        let is_mastered = |topic_id: &str| record_of(topic_id).score >= self.config.mastery_floor;

        // 후보 선정
        let mut candidates = Vec::new();
        for topic in curriculum.topics() {
            let record = record_of(topic.id.as_str());
            let mastered = record.score >= self.config.mastery_floor;
            let review = mastered && record.confidence < self.config.review_confidence_threshold;
            if mastered && !review {
                continue;
            }

            let pending: Vec<TopicId> = topic
                .prerequisite_ids
                .iter()
                .filter(|p| !is_mastered(p.as_str()))
                .cloned()
                .collect();

            let mut priority = self.priority.priority(&record);
            if !review && !pending.is_empty() {
                match self.config.prerequisite_policy {
                    PrerequisitePolicy::Exclude => {
                        tracing::debug!(
                            "Excluding {} (unmastered prerequisites: {:?})",
                            topic.id,
                            pending
                        );
                        continue;
                    }
                    PrerequisitePolicy::Demote => {
                        priority -= self.config.prerequisite_penalty * pending.len() as f64;
                    }
                }
            }

            candidates.push(Candidate {
                topic_id: topic.id.clone(),
                priority: priority.max(0.0),
                review,
                pending_prerequisites: if review { Vec::new() } else { pending },
            });
            check()?;
        }

        // 우선순위 내림차순, 동률은 토픽 ID 오름차순
        candidates.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.topic_id.cmp(&b.topic_id))
        });

        let selected = select_respecting_prerequisites(candidates, self.config.max_topics_per_week);
        check()?;

        let entries = allocate_minutes(selected, budget_minutes, self.config.min_minutes_per_topic);
        check()?;

        let plan = StudyPlan {
            id: Uuid::new_v4(),
            student_id: student_id.to_string(),
            week_start: week_start(now),
            generated_at: now,
            budget_minutes,
            curriculum_version: curriculum.version(),
            entries,
        };

        check()?;
        self.sink.append(&plan)?;

        tracing::info!(
            "Generated plan {} for {}: {} topics, {} minutes",
            plan.id,
            student_id,
            plan.entries.len(),
            plan.total_minutes()
        );
        Ok(plan)
    }

    /// 새 세션으로 퀴즈 선택
    pub fn select_quiz(&self, student_id: &str, topic_id: &str, n: usize, now: DateTime<Utc>) -> Result<QuizSelection> {
        let mut session = QuizSession::new(student_id);
        self.select_quiz_in(&mut session, topic_id, n, now)
    }

    /// 세션 안에서 퀴즈 선택
    ///
    /// 목표 난이도(현재 점수 + 오프셋)에 가까운 순, 동률은 문항 ID 순.
    /// 세션에서 이미 낸 문항과 쿨다운 내에 맞힌 문항은 제외합니다.
    /// 문항이 부족하면 있는 만큼만 돌려주고 `shortfall`로 보고합니다.
    pub fn select_quiz_in(
        &self,
        session: &mut QuizSession,
        topic_id: &str,
        n: usize,
        now: DateTime<Utc>,
    ) -> Result<QuizSelection> {
        if n == 0 {
            return Err(EngineError::InvalidQuery("n must be positive".to_string()));
        }
        if !self.curriculum.current().contains(topic_id) {
            return Err(EngineError::UnknownTopic(topic_id.to_string()));
        }

        let student_id = session.student_id.clone();
        let score = self
            .mastery
            .snapshot_at(&student_id, now)?
            .get(topic_id)
            .map(|r| r.score)
            .unwrap_or(self.mastery.config().initial_score);
        let target = self.target.target(score);
        let cooldown_start = now - self.config.quiz_cooldown();

        let mut pool: Vec<Arc<QuizItem>> = self
            .bank
            .for_topic(topic_id)
            .into_iter()
            .filter(|item| !session.has_served(&item.id))
            .filter(|item| {
                self.mastery
                    .last_correct_at(&student_id, &item.id)
                    .map_or(true, |at| at <= cooldown_start)
            })
            .collect();

        pool.sort_by(|a, b| {
            let da = (a.difficulty - target).abs();
            let db = (b.difficulty - target).abs();
            da.partial_cmp(&db)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        pool.truncate(n);

        for item in &pool {
            session.served.insert(item.id.clone());
        }

        let shortfall = if pool.len() < n {
            tracing::warn!(
                "Topic {} has {} eligible quiz items, {} requested",
                topic_id,
                pool.len(),
                n
            );
            Some(Shortfall {
                topic_id: topic_id.to_string(),
                requested: n,
                available: pool.len(),
            })
        } else {
            None
        };

        Ok(QuizSelection {
            items: pool,
            target_difficulty: target,
            shortfall,
        })
    }
}

// ============================================================================
// Selection & Allocation
// ============================================================================

/// 탐욕 선택
///
/// 정렬된 후보 중 미숙련 선수 토픽이 모두 이미 선택된 첫 후보를 반복해서 고릅니다.
/// 결과 순서가 곧 학습 순서이므로 어떤 토픽도 미숙련 선수 토픽보다 앞서지 않습니다.
fn select_respecting_prerequisites(mut candidates: Vec<Candidate>, max_topics: usize) -> Vec<Candidate> {
    let mut selected: Vec<Candidate> = Vec::new();

    while selected.len() < max_topics {
        let position = candidates.iter().position(|c| {
            c.pending_prerequisites
                .iter()
                .all(|p| selected.iter().any(|s| &s.topic_id == p))
        });
        match position {
            Some(i) => selected.push(candidates.remove(i)),
            None => break,
        }
    }

    if !candidates.is_empty() {
        tracing::debug!("{} candidate topics deferred to a later week", candidates.len());
    }
    selected
}

/// 최소 할당 후 남은 시간을 우선순위 비례로 분배
///
/// 최소 할당을 채울 수 없으면 뒤쪽 토픽부터 제외합니다.
/// 소수점 이하는 최대 잉여 방식으로 배분해 합계가 정확히 예산이 됩니다.
fn allocate_minutes(mut selected: Vec<Candidate>, budget: u32, floor: u32) -> Vec<PlanEntry> {
    let floor = floor.max(1);
    while !selected.is_empty() && (selected.len() as u64) * u64::from(floor) > u64::from(budget) {
        selected.pop();
    }
    if selected.is_empty() {
        return Vec::new();
    }

    let n = selected.len() as u32;
    let remaining = budget - n * floor;
    let total_priority: f64 = selected.iter().map(|c| c.priority).sum();

    let shares: Vec<f64> = selected
        .iter()
        .map(|c| {
            if total_priority > 0.0 {
                f64::from(remaining) * c.priority / total_priority
            } else {
                f64::from(remaining) / f64::from(n)
            }
        })
        .collect();

    let mut minutes: Vec<u32> = shares.iter().map(|s| s.floor() as u32).collect();
    let assigned: u32 = minutes.iter().sum();
    let mut leftover = remaining.saturating_sub(assigned);

    let mut by_remainder: Vec<usize> = (0..shares.len()).collect();
    by_remainder.sort_by(|&a, &b| {
        let ra = shares[a] - shares[a].floor();
        let rb = shares[b] - shares[b].floor();
        rb.partial_cmp(&ra).unwrap_or(Ordering::Equal).then_with(|| a.cmp(&b))
    });
    for i in by_remainder {
        if leftover == 0 {
            break;
        }
        minutes[i] += 1;
        leftover -= 1;
    }

    selected
        .into_iter()
        .zip(minutes)
        .map(|(c, extra)| PlanEntry {
            topic_id: c.topic_id,
            allocated_minutes: floor + extra,
            priority: c.priority,
            review: c.review,
        })
        .collect()
}

/// 계획 항목 순서가 선수 관계를 지키는지 확인 (review 항목 제외)
pub fn respects_prerequisites(
    plan: &StudyPlan,
    prerequisites: &BTreeMap<TopicId, Vec<TopicId>>,
    mastered: &HashSet<TopicId>,
) -> bool {
    let mut seen: HashSet<&str> = HashSet::new();
    for entry in &plan.entries {
        if !entry.review {
            let blocked = prerequisites
                .get(&entry.topic_id)
                .into_iter()
                .flatten()
                .any(|p| !mastered.contains(p) && !seen.contains(p.as_str()));
            if blocked {
                return false;
            }
        }
        seen.insert(entry.topic_id.as_str());
    }
    true
}

// ============================================================================
// Tests
// ============================================================================
