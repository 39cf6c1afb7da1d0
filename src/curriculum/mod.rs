//! Curriculum 모듈 - 토픽 선수관계 DAG
//!
//! 커리큘럼은 불변 스냅샷(`Curriculum`)으로 다룹니다.
//! 변경은 `CurriculumRegistry::publish`로 새 버전을 만들어 교체하며,
//! 이미 스냅샷을 받은 읽기 측은 영향을 받지 않습니다.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// 토픽 ID
pub type TopicId = String;

// ============================================================================
// Types
// ============================================================================

/// 커리큘럼 토픽
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    #[serde(default, alias = "prerequisites")]
    pub prerequisite_ids: BTreeSet<TopicId>,
}

impl Topic {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            prerequisite_ids: BTreeSet::new(),
        }
    }

    pub fn with_prerequisites<I, S>(mut self, prerequisites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prerequisite_ids = prerequisites.into_iter().map(Into::into).collect();
        self
    }
}

// ============================================================================
// Curriculum
// ============================================================================

/// 검증된 커리큘럼 스냅샷 (불변)
#[derive(Debug, Clone)]
pub struct Curriculum {
    version: u64,
    topics: BTreeMap<TopicId, Topic>,
    /// 선수 토픽이 항상 앞에 오는 순서 (동률은 ID 오름차순)
    order: Vec<TopicId>,
}

impl Curriculum {
    /// 토픽 목록으로 커리큘럼 생성
    ///
    /// 중복 ID, 없는 선수 토픽, 자기 참조, 순환을 거부합니다.
    pub fn new(version: u64, topics: Vec<Topic>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for topic in topics {
            if topic.id.trim().is_empty() {
                return Err(EngineError::InvalidCurriculum("empty topic id".to_string()));
            }
            if let Some(prev) = map.insert(topic.id.clone(), topic) {
                return Err(EngineError::InvalidCurriculum(format!(
                    "duplicate topic id: {}",
                    prev.id
                )));
            }
        }

        for topic in map.values() {
            for prereq in &topic.prerequisite_ids {
                if prereq == &topic.id {
                    return Err(EngineError::InvalidCurriculum(format!(
                        "topic {} lists itself as a prerequisite",
                        topic.id
                    )));
                }
                if !map.contains_key(prereq) {
                    return Err(EngineError::InvalidCurriculum(format!(
                        "topic {} requires unknown topic {}",
                        topic.id, prereq
                    )));
                }
            }
        }

        let order = topological_order(&map)?;

        Ok(Self {
            version,
            topics: map,
            order,
        })
    }

    /// 빈 커리큘럼 (버전 0)
    pub fn empty() -> Self {
        Self {
            version: 0,
            topics: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn topic(&self, id: &str) -> Option<&Topic> {
        self.topics.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.topics.contains_key(id)
    }

    /// ID 오름차순 토픽 목록
    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.values()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn topological_order(&self) -> &[TopicId] {
        &self.order
    }

    /// 토픽의 직접 선수 토픽
    pub fn prerequisites_of(&self, id: &str) -> Result<&BTreeSet<TopicId>> {
        self.topics
            .get(id)
            .map(|t| &t.prerequisite_ids)
            .ok_or_else(|| EngineError::UnknownTopic(id.to_string()))
    }
}

/// Kahn 알고리즘 위상 정렬 (순환 검출 포함)
fn topological_order(topics: &BTreeMap<TopicId, Topic>) -> Result<Vec<TopicId>> {
    let mut in_degree: BTreeMap<&str, usize> = topics
        .values()
        .map(|t| (t.id.as_str(), t.prerequisite_ids.len()))
        .collect();

    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for topic in topics.values() {
        for prereq in &topic.prerequisite_ids {
            dependents.entry(prereq.as_str()).or_default().push(topic.id.as_str());
        }
    }

    // BTreeSet으로 가장 작은 ID부터 꺼내서 결정적 순서 보장
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(topics.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());

        if let Some(children) = dependents.get(id) {
            for child in children {
                if let Some(d) = in_degree.get_mut(child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
    }

    if order.len() != topics.len() {
        let mut cyclic: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(id, _)| *id)
            .collect();
        cyclic.truncate(5);
        return Err(EngineError::InvalidCurriculum(format!(
            "prerequisite cycle involving: {}",
            cyclic.join(", ")
        )));
    }

    Ok(order)
}

// ============================================================================
// CurriculumRegistry
// ============================================================================

/// 버전 관리되는 커리큘럼 저장소
///
/// 읽기는 `Arc` 스냅샷을 복제해서 가져가므로 교체 중에도 일관된 뷰를 봅니다.
#[derive(Debug)]
pub struct CurriculumRegistry {
    current: RwLock<Arc<Curriculum>>,
}

impl CurriculumRegistry {
    pub fn new(curriculum: Curriculum) -> Self {
        Self {
            current: RwLock::new(Arc::new(curriculum)),
        }
    }

    /// 현재 스냅샷
    pub fn current(&self) -> Arc<Curriculum> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// 새 버전 게시
    ///
    /// 검증에 실패하면 기존 버전이 그대로 유지됩니다.
    pub fn publish(&self, topics: Vec<Topic>) -> Result<Arc<Curriculum>> {
        let mut guard = self.current.write().map_err(EngineError::lock)?;
        let next = Curriculum::new(guard.version() + 1, topics)?;
        Ok(Self::swap(&mut guard, next))
    }

    /// 미리 만들어 둔 다음 버전을 설치
    ///
    /// 버전이 현재 + 1이 아니면 `InvalidCurriculum` (그 사이 다른 게시가 있었음).
    pub fn install(&self, next: Curriculum) -> Result<Arc<Curriculum>> {
        let mut guard = self.current.write().map_err(EngineError::lock)?;
        if next.version() != guard.version() + 1 {
            return Err(EngineError::InvalidCurriculum(format!(
                "cannot install v{} over v{}",
                next.version(),
                guard.version()
            )));
        }
        Ok(Self::swap(&mut guard, next))
    }

    fn swap(guard: &mut Arc<Curriculum>, next: Curriculum) -> Arc<Curriculum> {
        let next = Arc::new(next);
        *guard = Arc::clone(&next);

        tracing::info!(
            "Published curriculum v{} ({} topics)",
            next.version(),
            next.len()
        );
        next
    }
}

impl Default for CurriculumRegistry {
    fn default() -> Self {
        Self::new(Curriculum::empty())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Topic> {
        vec![
            Topic::new("calc1", "Calculus I"),
            Topic::new("calc2", "Calculus II").with_prerequisites(["calc1"]),
            Topic::new("linalg", "Linear Algebra"),
            Topic::new("ode", "Differential Equations").with_prerequisites(["calc2", "linalg"]),
        ]
    }

    #[test]
    fn test_topological_order_respects_prerequisites() {
        let c = Curriculum::new(1, sample()).unwrap();
        let order = c.topological_order();
        let pos = |id: &str| order.iter().position(|t| t == id).unwrap();

        assert!(pos("calc1") < pos("calc2"));
        assert!(pos("calc2") < pos("ode"));
        assert!(pos("linalg") < pos("ode"));
        // 동률은 ID 오름차순
        assert_eq!(order[0], "calc1");
    }

    #[test]
    fn test_cycle_rejected() {
        let topics = vec![
            Topic::new("a", "A").with_prerequisites(["c"]),
            Topic::new("b", "B").with_prerequisites(["a"]),
            Topic::new("c", "C").with_prerequisites(["b"]),
        ];
        let err = Curriculum::new(1, topics).unwrap_err();
        assert!(matches!(err, EngineError::InvalidCurriculum(msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_self_loop_and_unknown_prereq_rejected() {
        let err = Curriculum::new(1, vec![Topic::new("a", "A").with_prerequisites(["a"])]);
        assert!(err.is_err());

        let err = Curriculum::new(1, vec![Topic::new("a", "A").with_prerequisites(["zzz"])]);
        assert!(matches!(err, Err(EngineError::InvalidCurriculum(msg)) if msg.contains("zzz")));
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let err = Curriculum::new(1, vec![Topic::new("a", "A"), Topic::new("a", "A again")]);
        assert!(err.is_err());
    }

    #[test]
    fn test_registry_publish_creates_new_version() {
        let registry = CurriculumRegistry::default();
        let before = registry.current();
        assert_eq!(before.version(), 0);

        registry.publish(sample()).unwrap();
        let after = registry.current();
        assert_eq!(after.version(), 1);
        assert!(after.contains("ode"));

        // 이전 스냅샷은 그대로
        assert!(before.is_empty());
    }

    #[test]
    fn test_registry_keeps_old_version_on_invalid_publish() {
        let registry = CurriculumRegistry::default();
        registry.publish(sample()).unwrap();

        let bad = vec![Topic::new("x", "X").with_prerequisites(["x"])];
        assert!(registry.publish(bad).is_err());
        assert_eq!(registry.current().version(), 1);
        assert!(registry.current().contains("calc1"));
    }

    #[test]
    fn test_install_requires_next_version() {
        let registry = CurriculumRegistry::default();
        let stale = Curriculum::new(2, sample()).unwrap();
        assert!(matches!(
            registry.install(stale),
            Err(EngineError::InvalidCurriculum(_))
        ));
        assert_eq!(registry.current().version(), 0);

        let next = Curriculum::new(1, sample()).unwrap();
        assert_eq!(registry.install(next).unwrap().version(), 1);
    }

    #[test]
    fn test_prerequisites_of_unknown_topic() {
        let c = Curriculum::new(1, sample()).unwrap();
        assert_eq!(c.prerequisites_of("ode").unwrap().len(), 2);
        assert!(matches!(
            c.prerequisites_of("nope"),
            Err(EngineError::UnknownTopic(_))
        ));
    }
}
