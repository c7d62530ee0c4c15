//! Turns the detection model's chapter candidates into an ordered,
//! non-overlapping, in-bounds chapter list.
//!
//! Bad candidates are repaired or dropped one at a time; the only failure is
//! ending up with nothing at all.

use crate::error::PipelineError;
use crate::models::{Chapter, RawChapter};
use serde::Serialize;
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorConfig {
    /// Exclusive `(low, high)` band of `end - start` that marks a first
    /// chapter starting on page 1 as a misread section-number range.
    /// `None` disables the heuristic.
    pub suspicious_span: Option<(i64, i64)>,
    /// Pages assumed per chapter when a range has to be re-derived.
    pub estimated_chapter_pages: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            suspicious_span: Some((50, 200)),
            estimated_chapter_pages: 40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Discarded,
    Repaired,
}

/// One repair or discard decision, kept for the run log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub ordinal: usize,
    pub title: String,
    pub kind: DiagnosticKind,
    pub reason: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let action = match self.kind {
            DiagnosticKind::Discarded => "Skipping",
            DiagnosticKind::Repaired => "Adjusting",
        };
        let title = if self.title.is_empty() {
            "<untitled>"
        } else {
            self.title.as_str()
        };
        write!(
            f,
            "{} chapter candidate {} \"{}\": {}",
            action,
            self.ordinal + 1,
            title,
            self.reason
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedChapters {
    pub chapters: Vec<Chapter>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Default)]
pub struct PageRangeValidator {
    config: ValidatorConfig,
}

impl PageRangeValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn validate(
        &self,
        raw: Vec<RawChapter>,
        page_cap: u32,
    ) -> Result<ValidatedChapters, PipelineError> {
        let cap = i64::from(page_cap);
        let estimate = i64::from(self.config.estimated_chapter_pages.max(1));
        let mut chapters: Vec<Chapter> = Vec::with_capacity(raw.len());
        let mut diagnostics = Vec::new();

        for (ordinal, candidate) in raw.into_iter().enumerate() {
            let title = candidate
                .title
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            let mut note = |kind: DiagnosticKind, reason: String| {
                let diagnostic = Diagnostic {
                    ordinal,
                    title: title.clone(),
                    kind,
                    reason,
                };
                warn!("{diagnostic}");
                diagnostics.push(diagnostic);
            };

            if title.is_empty() {
                note(DiagnosticKind::Discarded, "missing chapter title".into());
                continue;
            }
            let (Some(mut start), Some(mut end)) = (candidate.start_page, candidate.end_page) else {
                note(DiagnosticKind::Discarded, "missing page numbers".into());
                continue;
            };

            if let Some((low, high)) = self.config.suspicious_span {
                let span = end.saturating_sub(start);
                if ordinal == 0 && start == 1 && span > low && span < high {
                    let estimated_start = 1 + ordinal as i64 * estimate;
                    let estimated_end = estimated_start + estimate - 1;
                    note(
                        DiagnosticKind::Repaired,
                        format!(
                            "range {start}-{end} looks like section numbers, estimating pages {estimated_start}-{estimated_end}"
                        ),
                    );
                    start = estimated_start;
                    end = estimated_end;
                }
            }

            if start < 1 || end < 1 || start > cap || end > cap {
                note(
                    DiagnosticKind::Discarded,
                    format!("page range {start}-{end} is outside 1-{cap}"),
                );
                continue;
            }

            if start > end {
                note(
                    DiagnosticKind::Discarded,
                    format!("page range {start}-{end} is reversed"),
                );
                continue;
            }

            if let Some(previous) = chapters.last() {
                let previous_end = i64::from(previous.end_page);
                if start <= previous_end {
                    let (old_start, old_end) = (start, end);
                    start = previous_end + 1;
                    if start > end {
                        end = start + estimate - 1;
                    }
                    if start > cap {
                        note(
                            DiagnosticKind::Discarded,
                            format!(
                                "overlaps previous chapter ending on page {previous_end} and no pages remain below {cap}"
                            ),
                        );
                        continue;
                    }
                    end = end.min(cap);
                    note(
                        DiagnosticKind::Repaired,
                        format!(
                            "overlaps previous chapter ending on page {previous_end}, moved {old_start}-{old_end} to {start}-{end}"
                        ),
                    );
                }
            }

            // Bounds were checked against `cap`, which fits in u32.
            chapters.push(Chapter::new(title, start as u32, end as u32));
        }

        if chapters.is_empty() {
            return Err(PipelineError::ChapterListEmpty);
        }

        Ok(ValidatedChapters {
            chapters,
            diagnostics,
        })
    }
}
