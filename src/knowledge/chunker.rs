//! Text Chunking Module
//!
//! 강의 자료 텍스트를 겹치는 구간으로 분할합니다.
//! 각 청크는 원문 바이트 구간을 함께 돌려주므로 `SourceRef`로 인용할 수 있습니다.

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// 청크 최대 크기 (바이트)
    pub max_characters: usize,
    /// 청크 간 겹침 크기 (바이트)
    pub overlap_characters: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_characters: 1000,
            overlap_characters: 200,
        }
    }
}

/// 원문 구간과 텍스트
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 구간으로 분할 (공백뿐인 구간은 제외)
    fn chunk(&self, text: &str) -> Vec<TextSpan>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// SentenceChunker
// ============================================================================

/// 문장 경계 인식 청커
///
/// 고정 윈도우로 자르되, 윈도우 후반부에 마침표나 줄바꿈이 있으면
/// 그 지점에서 끊습니다. 다음 청크는 `overlap_characters`만큼 앞에서 시작합니다.
pub struct SentenceChunker {
    config: ChunkConfig,
}

impl SentenceChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }
}

impl Chunker for SentenceChunker {
    fn chunk(&self, text: &str) -> Vec<TextSpan> {
        let max = self.config.max_characters.max(1);
        // 겹침이 윈도우 이상이면 진행이 안 되므로 절반으로 제한
        let overlap = self.config.overlap_characters.min(max / 2);

        let mut spans = Vec::new();
        let mut start = 0;

        while start < text.len() {
            let mut end = floor_char_boundary(text, (start + max).min(text.len()));
            if end <= start {
                end = ceil_char_boundary(text, start + 1);
            }

            if end < text.len() {
                let window = &text[start..end];
                let break_point = window.rfind(&['.', '\n'][..]);
                if let Some(bp) = break_point {
                    if bp > max / 2 {
                        end = start + bp + 1;
                    }
                }
            }

            if let Some(span) = trimmed_span(text, start, end) {
                spans.push(span);
            }

            if end >= text.len() {
                break;
            }

            let next = floor_char_boundary(text, end.saturating_sub(overlap));
            start = if next > start { next } else { end };
        }

        spans
    }

    fn name(&self) -> &'static str {
        "sentence"
    }
}

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(SentenceChunker::with_defaults())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 앞뒤 공백을 제외한 구간 (오프셋도 함께 조정)
fn trimmed_span(text: &str, start: usize, end: usize) -> Option<TextSpan> {
    let raw = &text[start..end];
    let leading = raw.len() - raw.trim_start().len();
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let s = start + leading;
    Some(TextSpan {
        start: s,
        end: s + trimmed.len(),
        text: trimmed.to_string(),
    })
}

/// UTF-8 경계로 내림
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// UTF-8 경계로 올림
fn ceil_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ============================================================================
// Tests
// ============================================================================
