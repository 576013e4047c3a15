//! Gemini `generateContent` client.

use crate::{ChatModel, EvaluateError};
use async_trait::async_trait;
use callgrade_utils::clip;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-pro";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct SystemInstruction<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: SystemInstruction<'a>,
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Debug, Deserialize)]
struct ReplyPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

enum Attempt {
    Done(String),
    Retry(EvaluateError),
    Fail(EvaluateError),
}

/// Deterministic (temperature 0) chat client with a small retry budget for
/// network errors, 429 and 5xx responses.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
    max_retries: u32,
    backoff: Duration,
}

impl GeminiClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self, EvaluateError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key.trim())
            .map_err(|e| EvaluateError::Config(format!("invalid api key header: {e}")))?;
        headers.insert("x-goog-api-key", key);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| EvaluateError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
            max_retries: 2,
            backoff: Duration::from_millis(500),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff = backoff;
        self
    }

    async fn attempt(&self, body: &GenerateRequest<'_>) -> Attempt {
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let resp = match self.client.post(&url).json(body).send().await {
            Ok(r) => r,
            Err(e) => return Attempt::Retry(EvaluateError::Transport(e.to_string())),
        };

        let status = resp.status();
        let text = match resp.text().await {
            Ok(t) => t,
            Err(e) => return Attempt::Retry(EvaluateError::Transport(e.to_string())),
        };
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Attempt::Fail(EvaluateError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let err = EvaluateError::Status {
                status: status.as_u16(),
                body: clip(&text),
            };
            return if status.as_u16() == 429 || status.is_server_error() {
                Attempt::Retry(err)
            } else {
                Attempt::Fail(err)
            };
        }

        match serde_json::from_str::<GenerateResponse>(&text) {
            Ok(parsed) => match reply_text(parsed) {
                Ok(t) => Attempt::Done(t),
                Err(e) => Attempt::Fail(e),
            },
            Err(e) => Attempt::Fail(EvaluateError::Decode(e.to_string())),
        }
    }
}

fn reply_text(parsed: GenerateResponse) -> Result<String, EvaluateError> {
    if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(EvaluateError::EmptyReply(format!("prompt blocked: {reason}")));
    }
    let Some(candidate) = parsed.candidates.into_iter().next() else {
        return Err(EvaluateError::EmptyReply("no candidates".into()));
    };
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
        return Err(EvaluateError::EmptyReply(format!("finish reason {reason}")));
    }
    Ok(text)
}

#[async_trait]
impl ChatModel for GeminiClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, EvaluateError> {
        let body = GenerateRequest {
            system_instruction: SystemInstruction { parts: [Part { text: system }] },
            contents: [Content {
                role: "user",
                parts: [Part { text: user }],
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        };

        let mut attempt_no = 0u32;
        loop {
            match self.attempt(&body).await {
                Attempt::Done(text) => {
                    debug!(model = %self.model, chars = text.len(), "model replied");
                    return Ok(text);
                }
                Attempt::Fail(e) => return Err(e),
                Attempt::Retry(e) if attempt_no < self.max_retries => {
                    let wait = self.backoff * 2u32.pow(attempt_no);
                    attempt_no += 1;
                    warn!(error = %e, attempt = attempt_no, wait_ms = wait.as_millis() as u64, "retrying model call");
                    tokio::time::sleep(wait).await;
                }
                Attempt::Retry(e) => return Err(e),
            }
        }
    }
}
