use crate::config::{LlmConfig, Provider};
use crate::error::PipelineError;
use crate::models::{ArtifactFormat, ChapterArtifact, Question, QuestionBank, RawChapter};
use crate::services::prompts;
use crate::services::render;
use crate::services::slicer::SourceDocument;
use crate::services::traits::{ChapterDetector, ExtractionRequest, QuestionExtractor};
use crate::utils::extract_json_block;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

pub struct LLMClient {
    client: reqwest::Client,
    config: LlmConfig,
    api_key: Option<String>,
}

impl LLMClient {
    pub fn new(config: LlmConfig, api_key: Option<String>) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(LLMClient {
            client,
            config,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        })
    }

    /// Send one prompt, optionally with a PDF attached, and return the
    /// model's text. `schema` asks for structured JSON output.
    async fn generate(
        &self,
        prompt: &str,
        pdf: Option<&[u8]>,
        schema: Option<Value>,
    ) -> Result<String, PipelineError> {
        debug!(
            "Sending prompt v{} to {:?} model {}",
            prompts::PROMPT_VERSION,
            self.config.provider,
            self.config.model
        );
        match self.config.provider {
            Provider::Ollama => {
                let mut body = json!({
                    "model": self.config.model,
                    "prompt": prompt,
                    "stream": false,
                    "options": {
                        "temperature": self.config.temperature
                    }
                });
                if let Some(schema) = schema {
                    body["format"] = prompts::to_json_schema(&schema);
                }
                let response = self.post_with_retry(&self.config.api_url, &body).await?;
                let parsed: OllamaGenerateResponse = serde_json::from_str(&response)
                    .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;
                Ok(parsed.response)
            }
            Provider::Gemini => {
                let mut parts = vec![json!({ "text": prompt })];
                if let Some(pdf) = pdf {
                    parts.push(json!({
                        "inline_data": {
                            "mime_type": "application/pdf",
                            "data": BASE64.encode(pdf)
                        }
                    }));
                }
                let mut generation_config = json!({ "temperature": self.config.temperature });
                if let Some(schema) = schema {
                    generation_config["responseMimeType"] = json!("application/json");
                    generation_config["responseSchema"] = schema;
                }
                let body = json!({
                    "contents": [{ "parts": parts }],
                    "generationConfig": generation_config
                });
                let url = format!(
                    "{}/models/{}:generateContent",
                    self.config.api_url.trim_end_matches('/'),
                    self.config.model
                );
                let response = self.post_with_retry(&url, &body).await?;
                let parsed: GeminiResponse = serde_json::from_str(&response)
                    .map_err(|e| PipelineError::MalformedResponse(e.to_string()))?;
                Ok(parsed.text())
            }
        }
    }

    async fn post_with_retry(&self, url: &str, body: &Value) -> Result<String, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match self.post_once(url, body).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = self
                        .config
                        .retry_backoff_ms
                        .saturating_mul(1u64 << attempt.min(16));
                    attempt += 1;
                    warn!(
                        "LLM request failed ({e}), retrying in {delay}ms (attempt {attempt}/{})",
                        self.config.max_retries
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<String, PipelineError> {
        let mut request_builder = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);

        if let Some(key) = &self.api_key {
            request_builder = match self.config.provider {
                Provider::Gemini => request_builder.header("x-goog-api-key", key),
                Provider::Ollama => request_builder.header("Authorization", format!("Bearer {key}")),
            };
        }

        let response = request_builder.send().await?;
        let status = response.status();
        let response_text = response.text().await?;
        if !status.is_success() {
            return Err(PipelineError::LlmStatus {
                status: status.as_u16(),
                body: response_text,
            });
        }
        debug!("LLM responded with {} bytes", response_text.len());
        Ok(response_text)
    }
}

impl ChapterDetector for LLMClient {
    async fn detect(&self, toc_text: &str) -> Result<Vec<RawChapter>, PipelineError> {
        let prompt = prompts::toc_prompt(toc_text);
        let response = self
            .generate(&prompt, None, Some(prompts::chapter_list_schema()))
            .await?;
        parse_chapter_candidates(&response)
    }
}

impl QuestionExtractor for LLMClient {
    async fn extract(
        &self,
        chapter_pdf: &[u8],
        request: &ExtractionRequest<'_>,
    ) -> Result<ChapterArtifact, PipelineError> {
        let mut prompt = prompts::question_prompt(
            request.format,
            request.board,
            request.subject,
            request.chapter_title,
        );

        // Ollama models only read text, so the chapter goes in the prompt.
        let pdf = match self.config.provider {
            Provider::Gemini => Some(chapter_pdf),
            Provider::Ollama => {
                let chapter = SourceDocument::load(chapter_pdf)?;
                let text = chapter.extract_text(1, chapter.page_count())?;
                prompt.push_str("\n\nChapter text:\n");
                prompt.push_str(&text);
                None
            }
        };

        match request.format {
            ArtifactFormat::Markdown => {
                let body = self.generate(&prompt, pdf, None).await?;
                Ok(ChapterArtifact::Markdown(render::markdown_with_metadata(
                    request.board,
                    request.subject,
                    &body,
                )))
            }
            ArtifactFormat::QuestionBank => {
                let response = self
                    .generate(&prompt, pdf, Some(prompts::question_bank_schema()))
                    .await?;
                Ok(ChapterArtifact::QuestionBank(QuestionBank {
                    board: request.board.to_string(),
                    subject: request.subject.to_string(),
                    chapter_title: request.chapter_title.to_string(),
                    questions: parse_questions(&response)?,
                }))
            }
        }
    }
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

impl GeminiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

fn json_payload(response: &str) -> Result<Value, PipelineError> {
    if response.trim().is_empty() {
        return Err(PipelineError::EmptyResponse);
    }
    let block = extract_json_block(response)
        .ok_or_else(|| PipelineError::MalformedResponse("no JSON found in response".into()))?;
    serde_json::from_str(block).map_err(|e| PipelineError::MalformedResponse(e.to_string()))
}

/// Accepts a bare array or an object wrapping it under `key`.
fn unwrap_list(payload: Value, key: &str) -> Result<Vec<Value>, PipelineError> {
    match payload {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(PipelineError::MalformedResponse(format!(
                "expected a JSON array or an object with '{key}'"
            ))),
        },
        _ => Err(PipelineError::MalformedResponse(
            "expected a JSON array".into(),
        )),
    }
}

/// Individual entries are never rejected here; the validator decides.
pub fn parse_chapter_candidates(response: &str) -> Result<Vec<RawChapter>, PipelineError> {
    let items = unwrap_list(json_payload(response)?, "chapters")?;
    Ok(items.into_iter().map(RawChapter::from_value).collect())
}

pub fn parse_questions(response: &str) -> Result<Vec<Question>, PipelineError> {
    let items = unwrap_list(json_payload(response)?, "questions")?;
    serde_json::from_value(Value::Array(items))
        .map_err(|e| PipelineError::MalformedResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_candidates_from_bare_array() {
        let response = r#"[
            {"chapterTitle": "Real Numbers", "startPage": 1, "endPage": 18},
            {"chapterTitle": "Polynomials", "startPage": "19", "endPage": 34}
        ]"#;
        let chapters = parse_chapter_candidates(response).unwrap();
        assert_eq!(
            chapters,
            vec![
                RawChapter::new("Real Numbers", 1, 18),
                RawChapter::new("Polynomials", 19, 34)
            ]
        );
    }

    #[test]
    fn chapter_candidates_from_wrapped_fenced_object() {
        let response = "Sure!\n```json\n{\"chapters\": [{\"title\": \"Sets\", \"startPage\": 3, \"endPage\": 9}, 7]}\n```";
        let chapters = parse_chapter_candidates(response).unwrap();
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0], RawChapter::new("Sets", 3, 9));
        assert_eq!(chapters[1], RawChapter::default());
    }

    #[test]
    fn blank_response_is_empty_error() {
        assert!(matches!(
            parse_chapter_candidates("  \n"),
            Err(PipelineError::EmptyResponse)
        ));
    }

    #[test]
    fn prose_response_is_malformed() {
        assert!(matches!(
            parse_chapter_candidates("I could not find a table of contents."),
            Err(PipelineError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_chapter_candidates("{\"pages\": 4}"),
            Err(PipelineError::MalformedResponse(_))
        ));
    }

    #[test]
    fn questions_parse_with_enums() {
        let response = r#"{"questions": [{
            "questionNumber": 1,
            "questionText": "Prove that root 2 is irrational.",
            "questionType": "Long Answer",
            "suggestedMarks": 5,
            "dokLevel": 3,
            "bloomsLevel": "Analyzing",
            "difficulty": "Hard"
        }]}"#;
        let questions = parse_questions(response).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].suggested_marks, 5);
    }

    #[test]
    fn questions_with_unknown_type_are_malformed() {
        let response = r#"[{
            "questionNumber": 1,
            "questionText": "?",
            "questionType": "Essay",
            "suggestedMarks": 5,
            "dokLevel": 3,
            "bloomsLevel": "Analyzing",
            "difficulty": "Hard"
        }]"#;
        assert!(matches!(
            parse_questions(response),
            Err(PipelineError::MalformedResponse(_))
        ));
    }

    #[test]
    fn empty_question_list_is_fine() {
        assert!(parse_questions("[]").unwrap().is_empty());
    }

    #[test]
    fn gemini_text_joins_parts() {
        let parsed: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "[{\"a\":" }, { "text": "1}]" }] } }]
        }))
        .unwrap();
        assert_eq!(parsed.text(), "[{\"a\":1}]");

        let empty: GeminiResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.text(), "");
    }

    #[test]
    fn blank_api_key_is_ignored() {
        let client = LLMClient::new(LlmConfig::default(), Some("  ".into())).unwrap();
        assert!(client.api_key.is_none());
    }

    #[tokio::test]
    async fn unreachable_server_fails_after_retries() {
        let config = LlmConfig {
            api_url: "http://127.0.0.1:9/api/generate".into(),
            max_retries: 1,
            retry_backoff_ms: 1,
            timeout_secs: 5,
            ..LlmConfig::default()
        };
        let client = LLMClient::new(config, None).unwrap();
        let err = client.detect("Contents").await.unwrap_err();
        assert!(matches!(err, PipelineError::Http(_)));
    }
}
