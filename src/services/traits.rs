//! Seams between the orchestrator and its collaborators. The LLM client
//! implements the two model-facing traits; tests plug in stubs.

use std::future::Future;

use crate::error::PipelineError;
use crate::models::{ArtifactFormat, ChapterArtifact, RawChapter};

/// What the extraction service needs to know about one chapter besides its pages.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRequest<'a> {
    pub board: &'a str,
    pub subject: &'a str,
    pub chapter_title: &'a str,
    pub format: ArtifactFormat,
}

/// Finds chapter boundaries in table-of-contents text. Output is untrusted.
pub trait ChapterDetector: Send + Sync {
    fn detect(
        &self,
        toc_text: &str,
    ) -> impl Future<Output = Result<Vec<RawChapter>, PipelineError>> + Send;
}

/// Extracts and classifies the questions in one sliced chapter PDF.
pub trait QuestionExtractor: Send + Sync {
    fn extract(
        &self,
        chapter_pdf: &[u8],
        request: &ExtractionRequest<'_>,
    ) -> impl Future<Output = Result<ChapterArtifact, PipelineError>> + Send;
}

/// Where finished files go.
pub trait ArtifactSink: Send + Sync {
    fn save(&self, filename: &str, bytes: &[u8]) -> Result<(), PipelineError>;
}
