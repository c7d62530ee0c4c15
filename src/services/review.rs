//! Checks a chapter list edited by hand before it replaces the validated one.
//! Unlike the validator nothing is repaired: the user gets the problems back.

use crate::models::Chapter;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewIssue {
    pub index: usize,
    pub message: String,
}

/// First problem found for each chapter; an empty result means the list can be used as-is.
pub fn check_edited(chapters: &[Chapter], page_cap: u32) -> Vec<ReviewIssue> {
    let mut issues = Vec::new();

    for (index, chapter) in chapters.iter().enumerate() {
        let message = if chapter.title.trim().is_empty() {
            Some("Chapter title is required".to_string())
        } else if chapter.start_page == 0 || chapter.end_page == 0 {
            Some("Please set valid page numbers (must be greater than 0)".to_string())
        } else if chapter.start_page >= chapter.end_page {
            Some("Start page must be less than end page".to_string())
        } else if chapter.end_page > page_cap {
            Some(format!("Page numbers must not exceed {page_cap}"))
        } else if index > 0 && chapter.start_page <= chapters[index - 1].end_page {
            Some("Chapter overlaps with previous chapter".to_string())
        } else {
            None
        };

        if let Some(message) = message {
            issues.push(ReviewIssue { index, message });
        }
    }

    issues
}
