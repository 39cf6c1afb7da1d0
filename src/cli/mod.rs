//! CLI 모듈
//!
//! study-copilot CLI 명령어 정의 및 구현

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{get_data_dir, EngineConfig};
use crate::embedding::has_api_key;
use crate::engine::{CurriculumFile, LearningEngine};
use crate::quiz::{DifficultyBand, ItemId};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "study-copilot")]
#[command(version, about = "근거 기반 적응형 학습 엔진", long_about = None)]
pub struct Cli {
    /// 데이터 디렉토리 (기본: ~/.study-copilot 또는 STUDY_COPILOT_DATA_DIR)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// 설정 파일 경로 (기본: <data_dir>/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 커리큘럼 관리
    Curriculum {
        #[command(subcommand)]
        action: CurriculumAction,
    },

    /// 학습 자료를 토픽에 수집
    Ingest {
        /// 대상 토픽 ID
        #[arg(long)]
        topic: String,

        /// 수집할 텍스트 파일
        #[arg(long)]
        file: Option<PathBuf>,

        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 출처 문서 이름 (기본: 파일명 또는 "direct-input")
        #[arg(short, long)]
        document: Option<String>,
    },

    /// 인용 근거 기반 질문 답변
    Ask {
        /// 질문
        question: String,

        /// 특정 토픽으로 검색 제한
        #[arg(long)]
        topic: Option<String>,

        /// 인용 후보 수
        #[arg(short, long)]
        k: Option<usize>,

        /// 답변 생성 없이 인용만 출력
        #[arg(long)]
        sources_only: bool,
    },

    /// 퀴즈 문항 선택
    Quiz {
        #[arg(short, long)]
        student: String,

        #[arg(long)]
        topic: String,

        /// 문항 수
        #[arg(short, default_value = "5")]
        n: usize,
    },

    /// 수집된 자료로 퀴즈 문항 생성 (언어 모델 필요)
    Generate {
        #[arg(long)]
        topic: String,

        /// 난이도 구간 (easy, medium, hard)
        #[arg(short, long, default_value = "medium")]
        band: DifficultyBand,

        /// 생성할 문항 수
        #[arg(short, default_value = "5")]
        n: usize,
    },

    /// 퀴즈 답안 제출
    Submit {
        #[arg(short, long)]
        student: String,

        /// 문항=보기번호 목록 (예: q1=0,q2=3)
        #[arg(short, long)]
        answers: String,
    },

    /// 숙련도 리포트
    Mastery {
        #[arg(short, long)]
        student: String,
    },

    /// 주간 학습 계획 생성
    Plan {
        #[arg(short, long)]
        student: String,

        /// 주간 학습 시간 (분)
        #[arg(short, long, default_value = "300")]
        minutes: u32,

        /// 새로 생성하지 않고 이력만 출력
        #[arg(long)]
        history: bool,
    },

    /// 청크 삭제
    Delete {
        /// 삭제할 청크 ID
        chunk_id: String,
    },

    /// 상태 확인
    Status,
}

#[derive(Subcommand)]
pub enum CurriculumAction {
    /// JSON 커리큘럼 파일 적재 (토픽 + 퀴즈 문항)
    Load {
        file: PathBuf,
    },

    /// 현재 커리큘럼 출력 (선수 관계 순서)
    Show,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let data_dir = cli.data_dir.clone().unwrap_or_else(get_data_dir);
    let config = match cli.config {
        Some(ref path) => EngineConfig::load(path)
            .with_context(|| format!("설정 파일 로드 실패: {}", path.display()))?,
        None => EngineConfig::load_or_default(&data_dir).context("설정 로드 실패")?,
    };

    if let Commands::Status = cli.command {
        return cmd_status(data_dir, config);
    }

    let engine = LearningEngine::open(&data_dir, config).context("엔진 초기화 실패")?;

    match cli.command {
        Commands::Curriculum { action } => match action {
            CurriculumAction::Load { file } => cmd_curriculum_load(&engine, file),
            CurriculumAction::Show => cmd_curriculum_show(&engine),
        },
        Commands::Ingest {
            topic,
            file,
            text,
            document,
        } => cmd_ingest(&engine, &topic, file, text, document).await,
        Commands::Ask {
            question,
            topic,
            k,
            sources_only,
        } => cmd_ask(&engine, &question, topic.as_deref(), k, sources_only).await,
        Commands::Quiz { student, topic, n } => cmd_quiz(&engine, &student, &topic, n),
        Commands::Generate { topic, band, n } => cmd_generate(&engine, &topic, band, n).await,
        Commands::Submit { student, answers } => cmd_submit(&engine, &student, &answers),
        Commands::Mastery { student } => cmd_mastery(&engine, &student),
        Commands::Plan {
            student,
            minutes,
            history,
        } => cmd_plan(&engine, &student, minutes, history),
        Commands::Delete { chunk_id } => cmd_delete(&engine, &chunk_id),
        Commands::Status => Ok(()),
    }
}

/// 커리큘럼 적재 명령어
fn cmd_curriculum_load(engine: &LearningEngine, file: PathBuf) -> Result<()> {
    println!("[*] 커리큘럼 로드 중: {}", file.display());

    let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("파일 읽기 실패: {}", file.display()))?;
    let parsed: CurriculumFile = serde_json::from_str(&raw).context("커리큘럼 JSON 파싱 실패")?;

    let loaded = engine.load_curriculum(parsed).context("커리큘럼 적재 실패")?;

    println!("[OK] 커리큘럼 v{} 게시됨", loaded.version);
    println!("     토픽: {} 개", loaded.topics);
    println!("     새 퀴즈 문항: {} 개", loaded.new_quiz_items);

    Ok(())
}

/// 커리큘럼 출력 명령어
fn cmd_curriculum_show(engine: &LearningEngine) -> Result<()> {
    let curriculum = engine.curriculum();

    if curriculum.is_empty() {
        println!("[!] 적재된 커리큘럼이 없습니다.");
        println!("    적재: study-copilot curriculum load <file.json>");
        return Ok(());
    }

    println!("[OK] 커리큘럼 v{} ({} 토픽):\n", curriculum.version(), curriculum.len());

    for topic_id in curriculum.topological_order() {
        let Some(topic) = curriculum.topic(topic_id) else {
            continue;
        };
        println!("  {:<20} {}", topic.id, topic.name);
        if !topic.prerequisite_ids.is_empty() {
            let prereqs: Vec<&str> = topic.prerequisite_ids.iter().map(String::as_str).collect();
            println!("  {:<20} 선수: {}", "", prereqs.join(", "));
        }
    }

    Ok(())
}

/// 수집 명령어 (ingest)
async fn cmd_ingest(
    engine: &LearningEngine,
    topic: &str,
    file: Option<PathBuf>,
    text: Option<String>,
    document: Option<String>,
) -> Result<()> {
    let (content, default_name) = if let Some(ref path) = file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("파일 읽기 실패: {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        (content, name)
    } else if let Some(text) = text {
        (text, "direct-input".to_string())
    } else {
        bail!("--file 또는 --text 중 하나를 지정해야 합니다");
    };
    let document = document.unwrap_or(default_name);

    println!("[*] 청킹 및 임베딩 생성 중: {} → {}", document, topic);

    let report = engine
        .ingest_text(&document, topic, &content)
        .await
        .context("자료 수집 실패")?;

    if report.chunk_ids.is_empty() {
        println!("[!] 생성된 청크가 없습니다 (빈 문서)");
        return Ok(());
    }

    println!(
        "[OK] {} 청크 처리됨 (새 청크: {})",
        report.chunk_ids.len(),
        report.new_chunks
    );

    Ok(())
}

/// 질문 명령어 (ask)
async fn cmd_ask(
    engine: &LearningEngine,
    question: &str,
    topic: Option<&str>,
    k: Option<usize>,
    sources_only: bool,
) -> Result<()> {
    println!("[*] 검색 중: \"{}\"", question);

    if sources_only {
        let citations = engine.retrieve(question, topic, k).await.context("검색 실패")?;

        println!("\n[OK] 인용 ({} 건):\n", citations.len());
        for (i, citation) in citations.iter().enumerate() {
            println!("{}. [점수: {:.4}] {}", i + 1, citation.score, citation.source_ref);
            println!("   내용: {}", truncate_text(&citation.excerpt, 200));
            println!();
        }
        return Ok(());
    }

    if !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\
             설정: export GEMINI_API_KEY=your-key\n\
             (인용만 보려면 --sources-only)"
        );
    }

    let answer = engine.ask(question, topic, k).await.context("답변 생성 실패")?;

    println!("\n{}\n", answer.text);
    println!("[OK] 출처 ({} 건):", answer.citation_refs.len());
    for citation in &answer.citation_refs {
        println!("   - {} [점수: {:.4}]", citation.source_ref, citation.score);
    }

    Ok(())
}

/// 퀴즈 선택 명령어
fn cmd_quiz(engine: &LearningEngine, student: &str, topic: &str, n: usize) -> Result<()> {
    let selection = engine.select_quiz(student, topic, n).context("퀴즈 선택 실패")?;

    if let Some(ref shortfall) = selection.shortfall {
        println!(
            "[!] 문항 부족: {} 개 요청, {} 개 사용 가능",
            shortfall.requested, shortfall.available
        );
    }
    if selection.items.is_empty() {
        return Ok(());
    }

    println!(
        "[OK] 퀴즈 {} 문항 (목표 난이도: {:.2})\n",
        selection.items.len(),
        selection.target_difficulty
    );

    for item in &selection.items {
        println!("[{}] ({}, {:.2}) {}", item.id, item.band(), item.difficulty, item.item.question);
        for (i, option) in item.item.options.iter().enumerate() {
            println!("    {}. {}", i, option);
        }
        println!();
    }

    println!("제출: study-copilot submit -s {} -a {}=<번호>,...", student, selection.items[0].id);

    Ok(())
}

/// 문항 생성 명령어
async fn cmd_generate(engine: &LearningEngine, topic: &str, band: DifficultyBand, n: usize) -> Result<()> {
    if !has_api_key() {
        bail!("문항 생성에는 API 키가 필요합니다. GEMINI_API_KEY 또는 GOOGLE_AI_API_KEY를 설정하세요.");
    }

    println!("[*] {} 토픽 {} 문항 생성 중... ({})", topic, n, band);
    let generation = engine
        .generate_quiz(topic, band, n)
        .await
        .context("문항 생성 실패")?;

    println!(
        "[OK] 생성 {} 문항, 신규 등록 {} 문항\n",
        generation.generated,
        generation.new_items.len()
    );
    for item in &generation.new_items {
        println!("  [{}] {}", item.id, truncate_text(&item.item.question, 80));
    }

    Ok(())
}

/// 답안 제출 명령어
fn cmd_submit(engine: &LearningEngine, student: &str, answers: &str) -> Result<()> {
    let answers = parse_answers(answers)?;
    let report = engine.submit_answers(student, &answers).context("채점 실패")?;

    println!(
        "[OK] {}/{} 정답 ({:.0}%)\n",
        report.correct,
        report.total,
        report.ratio() * 100.0
    );

    for (attempt, record) in report.attempts.iter().zip(&report.records) {
        let mark = if attempt.correct { "O" } else { "X" };
        let explanation = engine
            .quiz_item(&attempt.item_id)
            .map(|item| item.item.explanation.clone())
            .unwrap_or_default();
        println!(
            "  [{}] {:<12} {} → 점수 {:.2}, 신뢰도 {:.2}",
            mark, attempt.item_id, record.topic_id, record.score, record.confidence
        );
        if !attempt.correct && !explanation.is_empty() {
            println!("       해설: {}", truncate_text(&explanation, 120));
        }
    }

    Ok(())
}

/// 숙련도 리포트 명령어
fn cmd_mastery(engine: &LearningEngine, student: &str) -> Result<()> {
    let report = engine.report(student).context("리포트 생성 실패")?;

    if report.topics.is_empty() {
        println!("{}", no_mastery_message(student));
        return Ok(());
    }

    println!("[OK] {} 숙련도:\n", report.student_id);
    for topic in &report.topics {
        println!(
            "  {:<20} 점수 {:.2}  신뢰도 {:.2}  시도 {:>3}  [{}] {}",
            topic.topic_id,
            topic.score,
            topic.confidence,
            topic.attempts,
            topic.band,
            topic.recommendation
        );
    }

    if !report.weak_topics.is_empty() {
        println!("\n  약점: {}", report.weak_topics.join(", "));
    }
    if !report.strong_topics.is_empty() {
        println!("  강점: {}", report.strong_topics.join(", "));
    }

    let attempts = engine.attempts(student).context("시도 기록 조회 실패")?;
    if let Some(last) = attempts.last() {
        println!(
            "\n  총 시도: {} 건 (마지막: {})",
            attempts.len(),
            last.timestamp.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

/// 학습 계획 명령어
fn cmd_plan(engine: &LearningEngine, student: &str, minutes: u32, history: bool) -> Result<()> {
    let plans = if history {
        engine.plan_history(student).context("계획 이력 조회 실패")?
    } else {
        vec![engine.generate_plan(student, minutes).context("계획 생성 실패")?]
    };

    if plans.is_empty() {
        println!("[!] 저장된 계획이 없습니다.");
        return Ok(());
    }

    for plan in &plans {
        println!(
            "[OK] {} 주 계획 ({} / {} 분, 커리큘럼 v{})",
            plan.week_start,
            plan.total_minutes(),
            plan.budget_minutes,
            plan.curriculum_version
        );
        if plan.entries.is_empty() {
            println!("     (배정할 토픽 없음)");
        }
        for entry in &plan.entries {
            let tag = if entry.review { " (복습)" } else { "" };
            println!(
                "     {:<20} {:>4} 분  우선순위 {:.3}{}",
                entry.topic_id, entry.allocated_minutes, entry.priority, tag
            );
        }
        println!();
    }

    Ok(())
}

/// 삭제 명령어 (delete)
fn cmd_delete(engine: &LearningEngine, chunk_id: &str) -> Result<()> {
    engine.delete_chunk(chunk_id).context("청크 삭제 실패")?;
    println!("[OK] 청크 {} 삭제됨", chunk_id);
    Ok(())
}

/// 상태 명령어 (status)
///
/// 엔진을 열 수 없어도 (API 키 없음 등) 가능한 정보를 출력합니다.
fn cmd_status(data_dir: PathBuf, config: EngineConfig) -> Result<()> {
    println!("study-copilot v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", data_dir.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    match LearningEngine::open(&data_dir, config) {
        Ok(engine) => match engine.status() {
            Ok(status) => {
                println!("[OK] 커리큘럼: v{} ({} 토픽)", status.curriculum_version, status.topics);
                println!("[OK] 인덱스: {} 청크 ({})", status.indexed_chunks, status.embedding);
                println!("[OK] 퀴즈 문항: {} 개", status.quiz_items);
                println!(
                    "[OK] 학생: {} 명, 숙련도 기록 {} 건, 계획 {} 건",
                    status.store.student_count,
                    status.store.mastery_revision_count,
                    status.store.plan_count
                );
                if let Some(model) = status.language_model {
                    println!("[OK] 언어 모델: {}", model);
                }
                let db_size = std::fs::metadata(&status.store.db_path)
                    .map(|m| m.len() as usize)
                    .unwrap_or(0);
                println!("     DB: {} ({})", status.store.db_path.display(), format_bytes(db_size));
            }
            Err(e) => {
                println!("[!] 통계 조회 실패: {}", e);
            }
        },
        Err(e) => {
            println!("[!] 엔진 초기화 실패: {}", e);
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `q1=0,q2=3` 형식의 답안 파싱
fn parse_answers(raw: &str) -> Result<Vec<(ItemId, usize)>> {
    let mut answers = Vec::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (item_id, choice) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("잘못된 답안 형식: '{}' (문항=번호)", pair))?;
        let choice: usize = choice
            .trim()
            .parse()
            .with_context(|| format!("보기 번호가 숫자가 아닙니다: '{}'", pair))?;
        answers.push((item_id.trim().to_string(), choice));
    }

    if answers.is_empty() {
        bail!("제출할 답안이 없습니다");
    }
    Ok(answers)
}

/// 텍스트 자르기 (UTF-8 안전)
/// 숙련도 기록이 없는 학생 안내
fn no_mastery_message(student: &str) -> String {
    format!(
        "[!] {} 학생의 숙련도 기록이 아직 없습니다. 먼저 퀴즈를 풀어보세요: study-copilot quiz -s {} --topic <토픽>",
        student, student
    )
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answers() {
        let answers = parse_answers("q1=0, q2 = 3,").unwrap();
        assert_eq!(answers, vec![("q1".to_string(), 0), ("q2".to_string(), 3)]);
    }

    #[test]
    fn test_parse_answers_rejects_malformed() {
        assert!(parse_answers("q1").is_err());
        assert!(parse_answers("q1=a").is_err());
        assert!(parse_answers(" , ").is_err());
    }

    #[test]
    fn test_cli_parses_global_options() {
        let cli = Cli::try_parse_from([
            "study-copilot",
            "plan",
            "-s",
            "alice",
            "--minutes",
            "90",
            "--data-dir",
            "/tmp/sc",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/sc")));
        assert!(matches!(
            cli.command,
            Commands::Plan { minutes: 90, history: false, .. }
        ));
    }

    #[test]
    fn test_no_mastery_message_names_student() {
        let message = no_mastery_message("alice");
        assert!(message.contains("alice"));
        assert!(message.contains("quiz"));
        assert!(!message.contains("커리큘럼"));
    }

    #[test]
    fn test_generate_band_parsing() {
        let cli = Cli::try_parse_from(["study-copilot", "generate", "--topic", "circuits", "-b", "hard", "-n", "2"])
            .unwrap();
        match cli.command {
            Commands::Generate { topic, band, n } => {
                assert_eq!(topic, "circuits");
                assert_eq!(band, DifficultyBand::Hard);
                assert_eq!(n, 2);
            }
            _ => panic!("expected generate"),
        }
        assert!(Cli::try_parse_from(["study-copilot", "generate", "--topic", "t", "-b", "extreme"]).is_err());
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }
}
