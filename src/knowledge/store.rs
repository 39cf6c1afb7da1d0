//! Study Store - rusqlite 기반 영속 저장소
//!
//! 커리큘럼, 청크, 퀴즈 문항, 숙련도 이력, 학습 계획을 저장합니다.
//! 저장 위치: <data_dir>/study.db
//!
//! - 숙련도 레코드는 append-only (변경마다 새 행, 삭제 없음)
//! - 계획은 본문과 항목을 한 트랜잭션으로 기록
//! - 청크 삭제는 `deleted` 플래그만 세움

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::curriculum::{Curriculum, Topic, TopicId};
use crate::error::{EngineError, Result};
use crate::mastery::{MasteryJournal, MasteryRecord, QuizAttempt, StudentId};
use crate::quiz::{ItemId, QuizContent, QuizItem};
use crate::scheduler::{PlanEntry, PlanSink, StudyPlan};

use super::vector::{Chunk, SourceRef};

/// 기본 DB 파일 이름
pub const DB_FILE_NAME: &str = "study.db";

// ============================================================================
// Types
// ============================================================================

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub curriculum_version: u64,
    pub topic_count: usize,
    pub chunk_count: usize,
    pub quiz_item_count: usize,
    pub student_count: usize,
    pub mastery_revision_count: usize,
    pub plan_count: usize,
    pub db_path: PathBuf,
}

// ============================================================================
// StudyStore
// ============================================================================

/// 학습 데이터 저장소
pub struct StudyStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl StudyStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 데이터 디렉토리 안에서 열기
    pub fn open_in(data_dir: &Path) -> Result<Self> {
        Self::open(&data_dir.join(DB_FILE_NAME))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS topics (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                prerequisites TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS chunks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                topic_id TEXT NOT NULL,
                document TEXT NOT NULL,
                span_start INTEGER NOT NULL,
                span_end INTEGER NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunks_topic ON chunks(topic_id);

            CREATE TABLE IF NOT EXISTS quiz_items (
                id TEXT PRIMARY KEY,
                topic_id TEXT NOT NULL,
                difficulty REAL NOT NULL,
                content TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_quiz_items_topic ON quiz_items(topic_id);

            CREATE TABLE IF NOT EXISTS quiz_attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                item_id TEXT NOT NULL,
                correct INTEGER NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_student ON quiz_attempts(student_id, item_id);

            CREATE TABLE IF NOT EXISTS mastery_records (
                revision INTEGER PRIMARY KEY AUTOINCREMENT,
                attempt_id INTEGER NOT NULL REFERENCES quiz_attempts(id),
                student_id TEXT NOT NULL,
                topic_id TEXT NOT NULL,
                score REAL NOT NULL,
                confidence REAL NOT NULL,
                attempts INTEGER NOT NULL,
                last_updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mastery_key ON mastery_records(student_id, topic_id);

            CREATE TABLE IF NOT EXISTS study_plans (
                id TEXT PRIMARY KEY,
                student_id TEXT NOT NULL,
                week_start TEXT NOT NULL,
                generated_at TEXT NOT NULL,
                budget_minutes INTEGER NOT NULL,
                curriculum_version INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_plans_student ON study_plans(student_id);

            CREATE TABLE IF NOT EXISTS plan_entries (
                plan_id TEXT NOT NULL REFERENCES study_plans(id),
                position INTEGER NOT NULL,
                topic_id TEXT NOT NULL,
                allocated_minutes INTEGER NOT NULL,
                priority REAL NOT NULL,
                review INTEGER NOT NULL,
                PRIMARY KEY (plan_id, position)
            );
            "#,
        )?;

        tracing::debug!("Study store initialized at {:?}", self.db_path);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Curriculum
    // ------------------------------------------------------------------------

    /// 커리큘럼 저장 (토픽 전체 교체 + 버전 기록)
    ///
    /// 함께 등록할 퀴즈 문항도 같은 트랜잭션으로 기록합니다.
    pub fn save_curriculum(&self, curriculum: &Curriculum, quiz_items: &[QuizItem]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(EngineError::lock)?;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM topics", [])?;
        for topic in curriculum.topics() {
            let prerequisites = serde_json::to_string(&topic.prerequisite_ids)?;
            tx.execute(
                "INSERT INTO topics (id, name, prerequisites) VALUES (?1, ?2, ?3)",
                params![topic.id, topic.name, prerequisites],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('curriculum_version', ?1)",
            params![curriculum.version().to_string()],
        )?;
        for item in quiz_items {
            insert_quiz_item(&tx, item)?;
        }
        tx.commit()?;

        tracing::info!(
            "Saved curriculum v{} ({} topics, {} quiz items)",
            curriculum.version(),
            curriculum.len(),
            quiz_items.len()
        );
        Ok(())
    }

    /// 청크, 퀴즈 문항, 숙련도 기록이 참조하는 토픽
    ///
    /// 커리큘럼 교체 시 이 토픽들은 빠질 수 없습니다.
    pub fn referenced_topics(&self) -> Result<BTreeSet<TopicId>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;
        let mut stmt = conn.prepare(
            "SELECT topic_id FROM chunks WHERE deleted = 0
             UNION SELECT topic_id FROM quiz_items
             UNION SELECT topic_id FROM mastery_records",
        )?;
        let topics = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(topics)
    }

    /// 저장된 커리큘럼 (없으면 None)
    pub fn load_curriculum(&self) -> Result<Option<Curriculum>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;

        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'curriculum_version'",
                [],
                |row| row.get(0),
            )
            .ok();
        let Some(version) = version else {
            return Ok(None);
        };
        let version: u64 = version
            .parse()
            .map_err(|_| EngineError::InvalidCurriculum(format!("bad stored version: {}", version)))?;

        let mut stmt = conn.prepare("SELECT id, name, prerequisites FROM topics ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut topics = Vec::new();
        for row in rows {
            let (id, name, prerequisites) = row?;
            let prerequisite_ids: Vec<String> = serde_json::from_str(&prerequisites)?;
            topics.push(Topic::new(id, name).with_prerequisites(prerequisite_ids));
        }

        Ok(Some(Curriculum::new(version, topics)?))
    }

    // ------------------------------------------------------------------------
    // Chunks
    // ------------------------------------------------------------------------

    /// 청크 저장. 새로 기록했으면 true
    pub fn save_chunk(&self, chunk: &Chunk) -> Result<bool> {
        Ok(self.save_chunks(std::slice::from_ref(chunk))? == 1)
    }

    /// 청크 일괄 저장 (한 트랜잭션)
    ///
    /// - 같은 내용의 살아있는 행: 건너뜀
    /// - 다른 내용의 살아있는 행: `InvalidQuery`, 아무 것도 기록하지 않음
    /// - 삭제된 행: 새 순번으로 되살림
    pub fn save_chunks(&self, chunks: &[Chunk]) -> Result<usize> {
        let mut conn = self.conn.lock().map_err(EngineError::lock)?;
        let tx = conn.transaction()?;
        let now = format_timestamp(Utc::now());
        let mut written = 0;

        for chunk in chunks {
            let existing: Option<(String, String, bool)> = tx
                .query_row(
                    "SELECT topic_id, text, deleted FROM chunks WHERE id = ?1",
                    params![chunk.id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
                )
                .optional()?;

            if let Some((topic_id, text, deleted)) = existing {
                if !deleted {
                    if topic_id == chunk.topic_id && text == chunk.text {
                        continue;
                    }
                    return Err(EngineError::InvalidQuery(format!(
                        "chunk {} is already stored under topic {}",
                        chunk.id, topic_id
                    )));
                }
                tx.execute("DELETE FROM chunks WHERE id = ?1", params![chunk.id])?;
            }

            tx.execute(
                "INSERT INTO chunks
                    (id, topic_id, document, span_start, span_end, text, embedding, deleted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
                params![
                    chunk.id,
                    chunk.topic_id,
                    chunk.source_ref.document,
                    chunk.source_ref.start as i64,
                    chunk.source_ref.end as i64,
                    chunk.text,
                    embedding_to_blob(&chunk.embedding),
                    now,
                ],
            )?;
            written += 1;
        }

        tx.commit()?;
        Ok(written)
    }

    /// 청크 소프트 삭제
    pub fn mark_chunk_deleted(&self, chunk_id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;
        let rows = conn.execute(
            "UPDATE chunks SET deleted = 1 WHERE id = ?1 AND deleted = 0",
            params![chunk_id],
        )?;
        Ok(rows > 0)
    }

    /// 살아있는 청크 (수집 순)
    pub fn load_chunks(&self) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;
        let mut stmt = conn.prepare(
            "SELECT id, topic_id, document, span_start, span_end, text, embedding
             FROM chunks WHERE deleted = 0 ORDER BY seq",
        )?;

        let chunks = stmt
            .query_map([], |row| {
                let blob: Vec<u8> = row.get(6)?;
                Ok(Chunk {
                    id: row.get(0)?,
                    topic_id: row.get(1)?,
                    source_ref: SourceRef::new(
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)? as usize,
                        row.get::<_, i64>(4)? as usize,
                    ),
                    text: row.get(5)?,
                    embedding: blob_to_embedding(&blob),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(chunks)
    }

    // ------------------------------------------------------------------------
    // Quiz Items
    // ------------------------------------------------------------------------

    pub fn save_quiz_item(&self, item: &QuizItem) -> Result<()> {
        self.save_quiz_items(std::slice::from_ref(item))
    }

    /// 퀴즈 문항 일괄 저장 (한 트랜잭션)
    pub fn save_quiz_items(&self, items: &[QuizItem]) -> Result<()> {
        let mut conn = self.conn.lock().map_err(EngineError::lock)?;
        let tx = conn.transaction()?;
        for item in items {
            insert_quiz_item(&tx, item)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_quiz_items(&self) -> Result<Vec<QuizItem>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;
        let mut stmt =
            conn.prepare("SELECT id, topic_id, difficulty, content FROM quiz_items ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut items = Vec::new();
        for row in rows {
            let (id, topic_id, difficulty, content) = row?;
            let item: QuizContent = serde_json::from_str(&content)?;
            items.push(QuizItem {
                id,
                topic_id,
                difficulty,
                item,
            });
        }
        Ok(items)
    }

    // ------------------------------------------------------------------------
    // Mastery
    // ------------------------------------------------------------------------

    /// 숙련도 이력 전체 (기록 순)
    pub fn load_mastery_revisions(&self) -> Result<Vec<MasteryRecord>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;
        let mut stmt = conn.prepare(
            "SELECT student_id, topic_id, score, confidence, attempts, last_updated
             FROM mastery_records ORDER BY revision",
        )?;

        let records = stmt
            .query_map([], |row| {
                Ok(MasteryRecord {
                    student_id: row.get(0)?,
                    topic_id: row.get(1)?,
                    score: row.get(2)?,
                    confidence: row.get(3)?,
                    attempts: row.get::<_, i64>(4)? as u32,
                    last_updated: parse_datetime(5, row.get::<_, String>(5)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(records)
    }

    /// (학생, 문항)별 마지막 정답 시각
    pub fn load_last_correct(&self) -> Result<Vec<(StudentId, ItemId, DateTime<Utc>)>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;
        let mut stmt = conn.prepare(
            "SELECT student_id, item_id, MAX(timestamp) FROM quiz_attempts
             WHERE correct = 1 GROUP BY student_id, item_id",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    parse_datetime(2, row.get::<_, String>(2)?)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<(StudentId, ItemId, DateTime<Utc>)>>>()?;

        Ok(rows)
    }

    /// 학생의 시도 기록 (오래된 순)
    pub fn attempts_for(&self, student_id: &str) -> Result<Vec<QuizAttempt>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;
        let mut stmt = conn.prepare(
            "SELECT student_id, item_id, correct, timestamp FROM quiz_attempts
             WHERE student_id = ?1 ORDER BY id",
        )?;

        let attempts = stmt
            .query_map(params![student_id], |row| {
                Ok(QuizAttempt {
                    student_id: row.get(0)?,
                    item_id: row.get(1)?,
                    correct: row.get::<_, i64>(2)? != 0,
                    timestamp: parse_datetime(3, row.get::<_, String>(3)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(attempts)
    }

    // ------------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;

        let count = |sql: &str| -> Result<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let curriculum_version: u64 = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'curriculum_version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(StoreStats {
            curriculum_version,
            topic_count: count("SELECT COUNT(*) FROM topics")?,
            chunk_count: count("SELECT COUNT(*) FROM chunks WHERE deleted = 0")?,
            quiz_item_count: count("SELECT COUNT(*) FROM quiz_items")?,
            student_count: count("SELECT COUNT(DISTINCT student_id) FROM mastery_records")?,
            mastery_revision_count: count("SELECT COUNT(*) FROM mastery_records")?,
            plan_count: count("SELECT COUNT(*) FROM study_plans")?,
            db_path: self.db_path.clone(),
        })
    }
}

impl MasteryJournal for StudyStore {
    fn append_revision(&self, attempt: &QuizAttempt, record: &MasteryRecord) -> Result<()> {
        let mut conn = self.conn.lock().map_err(EngineError::lock)?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO quiz_attempts (student_id, item_id, correct, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                attempt.student_id,
                attempt.item_id,
                attempt.correct as i64,
                format_timestamp(attempt.timestamp),
            ],
        )?;
        let attempt_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO mastery_records
                (attempt_id, student_id, topic_id, score, confidence, attempts, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                attempt_id,
                record.student_id,
                record.topic_id,
                record.score,
                record.confidence,
                i64::from(record.attempts),
                format_timestamp(record.last_updated),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }
}

impl PlanSink for StudyStore {
    fn append(&self, plan: &StudyPlan) -> Result<()> {
        let mut conn = self.conn.lock().map_err(EngineError::lock)?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO study_plans
                (id, student_id, week_start, generated_at, budget_minutes, curriculum_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                plan.id.to_string(),
                plan.student_id,
                plan.week_start.to_string(),
                format_timestamp(plan.generated_at),
                i64::from(plan.budget_minutes),
                plan.curriculum_version as i64,
            ],
        )?;

        for (position, entry) in plan.entries.iter().enumerate() {
            tx.execute(
                "INSERT INTO plan_entries
                    (plan_id, position, topic_id, allocated_minutes, priority, review)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    plan.id.to_string(),
                    position as i64,
                    entry.topic_id,
                    i64::from(entry.allocated_minutes),
                    entry.priority,
                    entry.review as i64,
                ],
            )?;
        }

        tx.commit()?;
        tracing::debug!("Persisted plan {} ({} entries)", plan.id, plan.entries.len());
        Ok(())
    }

    fn history(&self, student_id: &str) -> Result<Vec<StudyPlan>> {
        let conn = self.conn.lock().map_err(EngineError::lock)?;

        let mut stmt = conn.prepare(
            "SELECT id, student_id, week_start, generated_at, budget_minutes, curriculum_version
             FROM study_plans WHERE student_id = ?1 ORDER BY rowid",
        )?;
        let mut plans = stmt
            .query_map(params![student_id], |row| {
                let id: String = row.get(0)?;
                let week_start: String = row.get(2)?;
                Ok(StudyPlan {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
                    student_id: row.get(1)?,
                    week_start: NaiveDate::parse_from_str(&week_start, "%Y-%m-%d")
                        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
                    generated_at: parse_datetime(3, row.get::<_, String>(3)?)?,
                    budget_minutes: row.get::<_, i64>(4)? as u32,
                    curriculum_version: row.get::<_, i64>(5)? as u64,
                    entries: Vec::new(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut entry_stmt = conn.prepare(
            "SELECT topic_id, allocated_minutes, priority, review FROM plan_entries
             WHERE plan_id = ?1 ORDER BY position",
        )?;
        for plan in &mut plans {
            plan.entries = entry_stmt
                .query_map(params![plan.id.to_string()], |row| {
                    Ok(PlanEntry {
                        topic_id: row.get(0)?,
                        allocated_minutes: row.get::<_, i64>(1)? as u32,
                        priority: row.get(2)?,
                        review: row.get::<_, i64>(3)? != 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
        }

        Ok(plans)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 고정 폭 RFC3339 (문자열 비교 = 시간 비교)
fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(column: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

fn insert_quiz_item(conn: &Connection, item: &QuizItem) -> Result<()> {
    let content = serde_json::to_string(&item.item)?;
    conn.execute(
        "INSERT OR REPLACE INTO quiz_items (id, topic_id, difficulty, content)
         VALUES (?1, ?2, ?3, ?4)",
        params![item.id, item.topic_id, item.difficulty, content],
    )?;
    Ok(())
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
