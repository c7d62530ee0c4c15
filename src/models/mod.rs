use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A chapter candidate as reported by the detection model. Nothing in here
/// is trusted until it has been through the validator.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawChapter {
    #[serde(default, rename = "chapterTitle", alias = "title")]
    pub title: Option<String>,
    #[serde(default, rename = "startPage", deserialize_with = "lenient_page")]
    pub start_page: Option<i64>,
    #[serde(default, rename = "endPage", deserialize_with = "lenient_page")]
    pub end_page: Option<i64>,
}

impl RawChapter {
    pub fn new(title: impl Into<String>, start_page: i64, end_page: i64) -> Self {
        Self {
            title: Some(title.into()),
            start_page: Some(start_page),
            end_page: Some(end_page),
        }
    }

    /// Elements that are not chapter-shaped become an empty candidate and are
    /// discarded later with a logged reason.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }
}

fn lenient_page<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(page_number))
}

/// Anything beyond this is out of range for every page cap, and keeping
/// values inside it leaves room for range arithmetic.
const PAGE_NUMBER_LIMIT: i64 = u32::MAX as i64;

/// Whole numbers only: `15`, `15.0` and `"15"` are pages, `"1.1"` is a
/// section number and is rejected.
fn page_number(value: &Value) -> Option<i64> {
    let page = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }?;
    Some(page.clamp(-PAGE_NUMBER_LIMIT, PAGE_NUMBER_LIMIT))
}

/// A validated chapter: `1 <= start_page <= end_page`, 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(rename = "chapterTitle", alias = "title")]
    pub title: String,
    #[serde(rename = "startPage")]
    pub start_page: u32,
    #[serde(rename = "endPage")]
    pub end_page: u32,
}

impl Chapter {
    pub fn new(title: impl Into<String>, start_page: u32, end_page: u32) -> Self {
        Self {
            title: title.into(),
            start_page,
            end_page,
        }
    }

    pub fn page_span(&self) -> u32 {
        self.end_page.saturating_sub(self.start_page) + 1
    }
}

impl fmt::Display for Chapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: Pages {} - {}",
            self.title, self.start_page, self.end_page
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookMetadata {
    pub board: String,
    pub subject: String,
}

impl BookMetadata {
    pub fn is_complete(&self) -> bool {
        !self.board.trim().is_empty() && !self.subject.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactFormat {
    #[default]
    Markdown,
    QuestionBank,
}

impl FromStr for ArtifactFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "markdown" | "md" => Ok(Self::Markdown),
            "question_bank" | "questions" | "json" => Ok(Self::QuestionBank),
            other => Err(format!("unknown artifact format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionType {
    #[serde(rename = "MCQ")]
    Mcq,
    #[serde(rename = "Short Answer")]
    ShortAnswer,
    #[serde(rename = "Long Answer")]
    LongAnswer,
    #[serde(rename = "Case Based")]
    CaseBased,
    #[serde(rename = "Very Short Answer")]
    VeryShortAnswer,
    #[serde(rename = "Assertion-Reason")]
    AssertionReason,
    #[serde(rename = "Fill in the Blanks")]
    FillInTheBlanks,
    #[serde(rename = "True/False")]
    TrueFalse,
    #[serde(rename = "Match the Following")]
    MatchTheFollowing,
}

impl QuestionType {
    pub const ALL: [QuestionType; 9] = [
        Self::Mcq,
        Self::ShortAnswer,
        Self::LongAnswer,
        Self::CaseBased,
        Self::VeryShortAnswer,
        Self::AssertionReason,
        Self::FillInTheBlanks,
        Self::TrueFalse,
        Self::MatchTheFollowing,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Mcq => "MCQ",
            Self::ShortAnswer => "Short Answer",
            Self::LongAnswer => "Long Answer",
            Self::CaseBased => "Case Based",
            Self::VeryShortAnswer => "Very Short Answer",
            Self::AssertionReason => "Assertion-Reason",
            Self::FillInTheBlanks => "Fill in the Blanks",
            Self::TrueFalse => "True/False",
            Self::MatchTheFollowing => "Match the Following",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloomsLevel {
    Remembering,
    Understanding,
    Applying,
    Analyzing,
    Evaluating,
    Creating,
}

impl BloomsLevel {
    pub const ALL: [BloomsLevel; 6] = [
        Self::Remembering,
        Self::Understanding,
        Self::Applying,
        Self::Analyzing,
        Self::Evaluating,
        Self::Creating,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Depth of Knowledge, 1 (recall) to 4 (extended thinking).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DokLevel(u8);

impl DokLevel {
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DokLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (1..=4).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("DOK level must be between 1 and 4, got {value}"))
        }
    }
}

impl From<DokLevel> for u8 {
    fn from(level: DokLevel) -> Self {
        level.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub question_number: u32,
    pub question_text: String,
    pub question_type: QuestionType,
    pub suggested_marks: u32,
    pub dok_level: DokLevel,
    pub blooms_level: BloomsLevel,
    pub difficulty: Difficulty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionBank {
    pub board: String,
    pub subject: String,
    pub chapter_title: String,
    pub questions: Vec<Question>,
}

/// What the extraction service hands back for one sliced chapter.
#[derive(Debug, Clone, PartialEq)]
pub enum ChapterArtifact {
    Markdown(String),
    QuestionBank(QuestionBank),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Idle,
    LoadingPdf,
    AnalyzingToc,
    ReviewingChapters,
    ProcessingChapters,
    Done,
    Error,
}

impl RunState {
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::LoadingPdf | Self::AnalyzingToc | Self::ReviewingChapters | Self::ProcessingChapters
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LoadingPdf => "loading_pdf",
            Self::AnalyzingToc => "analyzing_toc",
            Self::ReviewingChapters => "reviewing_chapters",
            Self::ProcessingChapters => "processing_chapters",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}
