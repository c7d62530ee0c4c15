use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Could not identify chapters from the book's table of contents.")]
    ChapterListEmpty,

    #[error("The model returned an empty response.")]
    EmptyResponse,

    #[error("The model returned a malformed response: {0}")]
    MalformedResponse(String),

    #[error("LLM service responded with status {status}: {body}")]
    LlmStatus { status: u16, body: String },

    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("PDF error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to render artifact: {0}")]
    Render(String),

    #[error("Run cancelled by user.")]
    Cancelled,

    #[error("Chapter review failed: {0}")]
    Review(String),
}

impl PipelineError {
    /// Transient transport and server-side failures; everything else is
    /// surfaced to the run immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::LlmStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        let busy = PipelineError::LlmStatus { status: 429, body: String::new() };
        let down = PipelineError::LlmStatus { status: 503, body: String::new() };
        let bad = PipelineError::LlmStatus { status: 400, body: String::new() };
        assert!(busy.is_retryable());
        assert!(down.is_retryable());
        assert!(!bad.is_retryable());
        assert!(!PipelineError::EmptyResponse.is_retryable());
    }

    #[test]
    fn empty_chapter_list_message_is_user_facing() {
        assert_eq!(
            PipelineError::ChapterListEmpty.to_string(),
            "Could not identify chapters from the book's table of contents."
        );
    }
}
