use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::str::FromStr;

use crate::models::ArtifactFormat;
use crate::services::validator::ValidatorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    Gemini,
}

impl Provider {
    pub fn default_api_url(self) -> &'static str {
        match self {
            Provider::Ollama => "http://localhost:11434/api/generate",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Ollama => "llama3.1",
            Provider::Gemini => "gemini-2.5-flash",
        }
    }

    /// Hosted providers refuse unauthenticated calls; a local Ollama does not.
    pub fn requires_api_key(self) -> bool {
        matches!(self, Provider::Gemini)
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Ok(Provider::Ollama),
            "gemini" => Ok(Provider::Gemini),
            other => Err(format!("unknown LLM provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub api_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let provider = Provider::Ollama;
        Self {
            provider,
            api_url: provider.default_api_url().to_string(),
            model: provider.default_model().to_string(),
            temperature: 0.1,
            timeout_secs: 300,
            max_retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub toc_page_limit: u32,
    pub page_cap: u32,
    pub default_format: ArtifactFormat,
    pub validator: ValidatorConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            toc_page_limit: 20,
            page_cap: 5000,
            default_format: ArtifactFormat::Markdown,
            validator: ValidatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub output_dir: PathBuf,
    /// Initial credential; can be replaced at runtime through the API.
    pub api_key: Option<String>,
    pub llm: LlmConfig,
    pub pipeline: PipelineSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let provider = match var("LLM_PROVIDER") {
            Some(value) => value.parse::<Provider>().map_err(anyhow::Error::msg)?,
            None => Provider::Ollama,
        };
        let defaults = LlmConfig::default();
        let llm = LlmConfig {
            provider,
            api_url: var("LLM_API_URL").unwrap_or_else(|| provider.default_api_url().to_string()),
            model: var("LLM_MODEL").unwrap_or_else(|| provider.default_model().to_string()),
            temperature: parse_or(&var, "LLM_TEMPERATURE", defaults.temperature)?,
            timeout_secs: parse_or(&var, "LLM_TIMEOUT_SECS", defaults.timeout_secs)?,
            max_retries: parse_or(&var, "LLM_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_ms: parse_or(&var, "LLM_RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
        };

        let defaults = PipelineSettings::default();
        let default_format = match var("ARTIFACT_FORMAT") {
            Some(value) => value.parse::<ArtifactFormat>().map_err(anyhow::Error::msg)?,
            None => defaults.default_format,
        };
        let suspicious_span = match var("SUSPICIOUS_SPAN") {
            Some(value) => parse_span(&value).context("invalid SUSPICIOUS_SPAN")?,
            None => defaults.validator.suspicious_span,
        };
        let pipeline = PipelineSettings {
            toc_page_limit: parse_or(&var, "TOC_PAGE_LIMIT", defaults.toc_page_limit)?,
            page_cap: parse_or(&var, "PAGE_CAP", defaults.page_cap)?,
            default_format,
            validator: ValidatorConfig {
                suspicious_span,
                estimated_chapter_pages: parse_or(
                    &var,
                    "ESTIMATED_CHAPTER_PAGES",
                    defaults.validator.estimated_chapter_pages,
                )?,
            },
        };
        if pipeline.page_cap == 0 {
            bail!("PAGE_CAP must be at least 1");
        }

        Ok(Config {
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            output_dir: var("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./output")),
            api_key: var("LLM_API_KEY"),
            llm,
            pipeline,
        })
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: '{value}'")),
        None => Ok(default),
    }
}

/// `"50-200"` or `"off"`.
fn parse_span(value: &str) -> Result<Option<(i64, i64)>> {
    if value.eq_ignore_ascii_case("off") || value.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let Some((low, high)) = value.split_once('-') else {
        bail!("expected LOW-HIGH or 'off', got '{value}'");
    };
    let low: i64 = low.trim().parse()?;
    let high: i64 = high.trim().parse()?;
    if low >= high {
        bail!("span lower bound {low} must be below upper bound {high}");
    }
    Ok(Some((low, high)))
}
