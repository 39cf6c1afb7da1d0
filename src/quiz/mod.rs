//! Quiz 모듈 - 퀴즈 문항과 문항 은행
//!
//! 문항은 불변 콘텐츠입니다. 스케줄러는 문항을 선택만 하고 수정하지 않습니다.
//! 문항은 커리큘럼 파일로 등록하거나 `QuizGenerator`로 수집 자료에서 생성합니다.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::curriculum::{Curriculum, TopicId};
use crate::error::{EngineError, Result};

mod generator;

pub use generator::QuizGenerator;

/// 문항 ID
pub type ItemId = String;

// ============================================================================
// Types
// ============================================================================

/// 객관식 문항 본문
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizContent {
    pub question: String,
    pub options: Vec<String>,
    pub correct_index: usize,
    #[serde(default)]
    pub explanation: String,
}

/// 퀴즈 문항
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizItem {
    pub id: ItemId,
    pub topic_id: TopicId,
    /// 난이도 (0.0 ~ 1.0)
    pub difficulty: f64,
    pub item: QuizContent,
}

impl QuizItem {
    /// 구조 검증 (난이도 범위, 보기, 정답 인덱스)
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidQuery("quiz item id is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.difficulty) {
            return Err(EngineError::InvalidQuery(format!(
                "quiz item {} difficulty {} is outside [0, 1]",
                self.id, self.difficulty
            )));
        }
        if self.item.question.trim().is_empty() || self.item.options.len() < 2 {
            return Err(EngineError::InvalidQuery(format!(
                "quiz item {} needs a question and at least two options",
                self.id
            )));
        }
        if self.item.correct_index >= self.item.options.len() {
            return Err(EngineError::InvalidQuery(format!(
                "quiz item {} correct_index {} out of range",
                self.id, self.item.correct_index
            )));
        }
        Ok(())
    }

    /// 선택한 보기가 정답인지
    pub fn is_correct(&self, chosen_index: usize) -> bool {
        self.item.correct_index == chosen_index
    }

    pub fn band(&self) -> DifficultyBand {
        DifficultyBand::from_value(self.difficulty)
    }
}

/// 난이도 구간
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DifficultyBand {
    Easy,
    Medium,
    Hard,
}

impl DifficultyBand {
    /// easy < 0.4 <= medium < 0.7 <= hard
    pub fn from_value(value: f64) -> Self {
        if value < 0.4 {
            DifficultyBand::Easy
        } else if value < 0.7 {
            DifficultyBand::Medium
        } else {
            DifficultyBand::Hard
        }
    }
}

impl DifficultyBand {
    /// 생성 문항에 부여하는 구간 대표값
    pub fn midpoint(self) -> f64 {
        match self {
            DifficultyBand::Easy => 0.2,
            DifficultyBand::Medium => 0.55,
            DifficultyBand::Hard => 0.85,
        }
    }
}

impl FromStr for DifficultyBand {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(DifficultyBand::Easy),
            "medium" => Ok(DifficultyBand::Medium),
            "hard" => Ok(DifficultyBand::Hard),
            other => Err(EngineError::InvalidQuery(format!(
                "unknown difficulty band: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DifficultyBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DifficultyBand::Easy => "easy",
            DifficultyBand::Medium => "medium",
            DifficultyBand::Hard => "hard",
        };
        f.write_str(s)
    }
}

// ============================================================================
// QuizBank
// ============================================================================

/// 문항 은행 (토픽별 조회)
#[derive(Debug, Default)]
pub struct QuizBank {
    items: RwLock<BTreeMap<ItemId, Arc<QuizItem>>>,
}

impl QuizBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// 추가 가능 여부만 확인 (상태 변경 없음)
    ///
    /// 새 문항이면 true, 같은 내용이 이미 있으면 false.
    pub fn check(&self, curriculum: &Curriculum, item: &QuizItem) -> Result<bool> {
        item.validate()?;
        if !curriculum.contains(&item.topic_id) {
            return Err(EngineError::UnknownTopic(item.topic_id.clone()));
        }

        let items = self.items.read().map_err(EngineError::lock)?;
        Self::check_against(&items, item)
    }

    fn check_against(items: &BTreeMap<ItemId, Arc<QuizItem>>, item: &QuizItem) -> Result<bool> {
        match items.get(&item.id) {
            Some(existing) if **existing == *item => Ok(false),
            Some(_) => Err(EngineError::InvalidQuery(format!(
                "quiz item {} already exists with different content",
                item.id
            ))),
            None => Ok(true),
        }
    }

    /// 문항 추가
    ///
    /// 토픽이 커리큘럼에 없으면 `UnknownTopic`. 같은 ID, 같은 내용은 멱등입니다.
    pub fn insert(&self, curriculum: &Curriculum, item: QuizItem) -> Result<bool> {
        item.validate()?;
        if !curriculum.contains(&item.topic_id) {
            return Err(EngineError::UnknownTopic(item.topic_id));
        }

        let mut items = self.items.write().map_err(EngineError::lock)?;
        if !Self::check_against(&items, &item)? {
            return Ok(false);
        }
        items.insert(item.id.clone(), Arc::new(item));
        Ok(true)
    }

    /// 저장소 복원용 (검증된 문항을 그대로 적재)
    pub(crate) fn restore(&self, restored: Vec<QuizItem>) -> Result<()> {
        let mut items = self.items.write().map_err(EngineError::lock)?;
        for item in restored {
            items.insert(item.id.clone(), Arc::new(item));
        }
        Ok(())
    }

    pub fn get(&self, item_id: &str) -> Option<Arc<QuizItem>> {
        self.items.read().ok()?.get(item_id).cloned()
    }

    /// 토픽의 문항 목록 (ID 오름차순)
    pub fn for_topic(&self, topic_id: &str) -> Vec<Arc<QuizItem>> {
        match self.items.read() {
            Ok(items) => items
                .values()
                .filter(|i| i.topic_id == topic_id)
                .cloned()
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::Topic;

    pub(crate) fn item(id: &str, topic: &str, difficulty: f64) -> QuizItem {
        QuizItem {
            id: id.to_string(),
            topic_id: topic.to_string(),
            difficulty,
            item: QuizContent {
                question: format!("Question {}?", id),
                options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                correct_index: 1,
                explanation: String::new(),
            },
        }
    }

    fn curriculum() -> Curriculum {
        Curriculum::new(1, vec![Topic::new("T1", "Circuits")]).unwrap()
    }

    #[test]
    fn test_difficulty_bands() {
        assert_eq!(DifficultyBand::from_value(0.0), DifficultyBand::Easy);
        assert_eq!(DifficultyBand::from_value(0.39), DifficultyBand::Easy);
        assert_eq!(DifficultyBand::from_value(0.4), DifficultyBand::Medium);
        assert_eq!(DifficultyBand::from_value(0.69), DifficultyBand::Medium);
        assert_eq!(DifficultyBand::from_value(0.7), DifficultyBand::Hard);
        assert_eq!(DifficultyBand::Hard.to_string(), "hard");
    }

    #[test]
    fn test_validation() {
        assert!(item("q1", "T1", 0.5).validate().is_ok());
        assert!(item("q1", "T1", 1.2).validate().is_err());

        let mut bad = item("q1", "T1", 0.5);
        bad.item.correct_index = 4;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_insert_and_lookup() {
        let bank = QuizBank::new();
        let c = curriculum();

        assert!(bank.insert(&c, item("q2", "T1", 0.5)).unwrap());
        assert!(bank.insert(&c, item("q1", "T1", 0.3)).unwrap());
        assert!(!bank.insert(&c, item("q1", "T1", 0.3)).unwrap());

        let ids: Vec<String> = bank.for_topic("T1").iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["q1", "q2"]);
        assert!(bank.get("q2").unwrap().is_correct(1));
        assert_eq!(bank.len(), 2);
    }

    #[test]
    fn test_unknown_topic_rejected() {
        let bank = QuizBank::new();
        let err = bank.insert(&curriculum(), item("q1", "T9", 0.5)).unwrap_err();
        assert!(matches!(err, EngineError::UnknownTopic(t) if t == "T9"));
        assert!(bank.is_empty());
    }

    #[test]
    fn test_check_does_not_insert() {
        let bank = QuizBank::new();
        let c = curriculum();

        assert!(bank.check(&c, &item("q1", "T1", 0.5)).unwrap());
        assert!(bank.is_empty());

        bank.insert(&c, item("q1", "T1", 0.5)).unwrap();
        assert!(!bank.check(&c, &item("q1", "T1", 0.5)).unwrap());
        assert!(matches!(
            bank.check(&c, &item("q1", "T1", 0.9)),
            Err(EngineError::InvalidQuery(_))
        ));
        assert!(matches!(
            bank.check(&c, &item("q2", "T9", 0.5)),
            Err(EngineError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_band_parsing_and_midpoints() {
        assert_eq!("Hard".parse::<DifficultyBand>().unwrap(), DifficultyBand::Hard);
        assert!("extreme".parse::<DifficultyBand>().is_err());
        for band in [DifficultyBand::Easy, DifficultyBand::Medium, DifficultyBand::Hard] {
            assert_eq!(DifficultyBand::from_value(band.midpoint()), band);
        }
    }
}
