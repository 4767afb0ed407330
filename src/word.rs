use std::collections::HashMap;

/// Confidence assigned to words whose score is missing or unparsable.
/// It is below every threshold, so such words never reach the output.
pub const UNKNOWN_CONFIDENCE: f32 = -1.0;

/// Tesseract's iterator level for individual words.
const WORD_LEVEL: i32 = 5;

const TSV_COLUMNS: [&str; 12] = [
    "level",
    "page_num",
    "block_num",
    "par_num",
    "line_num",
    "word_num",
    "left",
    "top",
    "width",
    "height",
    "conf",
    "text",
];

/// One recognized word with its confidence (0-100) and image-local pixel box.
#[derive(Debug, Clone, PartialEq)]
pub struct WordBox {
    pub text: String,
    pub confidence: f32,
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
    pub block_num: i32,
    pub par_num: i32,
    pub line_num: i32,
}

/// The `(block, paragraph, line)` reading-order group of a word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineGroup {
    pub block: i32,
    pub paragraph: i32,
    pub line: i32,
}

impl WordBox {
    pub fn new(text: impl Into<String>, confidence: f32, group: LineGroup) -> Self {
        Self {
            text: text.into(),
            confidence,
            left: 0,
            top: 0,
            width: 0,
            height: 0,
            block_num: group.block,
            par_num: group.paragraph,
            line_num: group.line,
        }
    }

    pub fn with_bounds(mut self, left: i32, top: i32, width: i32, height: i32) -> Self {
        self.left = left;
        self.top = top;
        self.width = width;
        self.height = height;
        self
    }

    pub fn group(&self) -> LineGroup {
        LineGroup {
            block: self.block_num,
            paragraph: self.par_num,
            line: self.line_num,
        }
    }

    /// Whether the word survives `threshold`: strictly greater confidence and
    /// non-blank text.
    pub fn passes(&self, threshold: u8) -> bool {
        self.confidence > threshold as f32 && !self.text.trim().is_empty()
    }
}

/// Parses Tesseract's TSV output into word boxes.
///
/// The header row is optional; without it the standard column order is
/// assumed. Rows for page/block/paragraph/line levels are skipped. Fields that
/// are missing or fail to parse fall back to [`UNKNOWN_CONFIDENCE`] for the
/// score and `0` for coordinates and group numbers, so a malformed row can
/// only ever produce a word that gets filtered out.
pub fn parse_tsv(tsv: &str) -> Vec<WordBox> {
    let mut lines = tsv.lines().filter(|line| !line.trim().is_empty()).peekable();

    let columns: HashMap<&str, usize> = match lines.peek() {
        Some(first) if first.starts_with("level") => {
            let header = lines.next().unwrap_or_default();
            header
                .split('\t')
                .enumerate()
                .map(|(i, name)| (name.trim(), i))
                .collect()
        }
        _ => TSV_COLUMNS
            .iter()
            .enumerate()
            .map(|(i, name)| (*name, i))
            .collect(),
    };
    let text_column = columns.get("text").copied().unwrap_or(TSV_COLUMNS.len() - 1);

    lines
        .filter_map(|line| {
            let fields = line.splitn(text_column + 1, '\t').collect::<Vec<_>>();
            let field = |name: &str| columns.get(name).and_then(|i| fields.get(*i)).copied();
            let int = |name: &str| {
                field(name)
                    .and_then(|value| value.trim().parse::<i32>().ok())
                    .unwrap_or(0)
            };

            if let Some(level) = field("level").and_then(|it| it.trim().parse::<i32>().ok()) {
                if level != WORD_LEVEL {
                    return None;
                }
            }

            let confidence = field("conf")
                .and_then(|value| value.trim().parse::<f32>().ok())
                .filter(|value| value.is_finite())
                .unwrap_or(UNKNOWN_CONFIDENCE);

            Some(WordBox {
                text: field("text").unwrap_or_default().to_string(),
                confidence,
                left: int("left"),
                top: int("top"),
                width: int("width"),
                height: int("height"),
                block_num: int("block_num"),
                par_num: int("par_num"),
                line_num: int("line_num"),
            })
        })
        .collect()
}
