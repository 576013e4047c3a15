//! Evaluator: grade a call transcript against a fixed sales rubric.

pub mod gemini;
pub mod rubric;
pub mod score;

use async_trait::async_trait;
use callgrade_utils::truncate_chars;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

pub use gemini::GeminiClient;
pub use rubric::Rubric;
pub use score::{delimited, score_reply, ScoreStrategy};

/// Default character budget for the transcript sent to the model.
pub const MAX_TRANSCRIPT_CHARS: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum EvaluateError {
    #[error("model provider rejected the API key (HTTP {0})")]
    Unauthorized(u16),
    #[error("model call failed with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model call failed: {0}")]
    Transport(String),
    #[error("malformed model response: {0}")]
    Decode(String),
    #[error("model returned no text ({0})")]
    EmptyReply(String),
    #[error("invalid model configuration: {0}")]
    Config(String),
}

/// Chat-style model: one system instruction, one user turn, free text back.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, EvaluateError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    pub rubric: Rubric,
    pub strategy: ScoreStrategy,
    /// Ask for a `PUNTAJE_FINAL:` line and prefer it over the heuristic.
    pub structured_score: bool,
    /// Transcript character budget; 0 sends the whole transcript.
    pub max_transcript_chars: usize,
}

impl EvaluatorConfig {
    pub fn for_rubric(rubric: Rubric) -> Self {
        Self {
            rubric,
            strategy: rubric.default_strategy(),
            structured_score: true,
            max_transcript_chars: MAX_TRANSCRIPT_CHARS,
        }
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self::for_rubric(Rubric::Full)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub analysis: String,
    pub score: f64,
}

#[instrument(skip(model, cfg, transcript), fields(rubric = ?cfg.rubric, chars = transcript.chars().count()))]
pub async fn evaluate(
    model: &dyn ChatModel,
    cfg: &EvaluatorConfig,
    transcript: &str,
) -> Result<Evaluation, EvaluateError> {
    let system = cfg.rubric.system_prompt(cfg.structured_score);
    let user = truncate_chars(transcript, cfg.max_transcript_chars);
    let analysis = model.complete(&system, user).await?;
    let score = score_reply(&analysis, cfg.strategy, cfg.structured_score);
    info!(score, "transcript graded");
    Ok(Evaluation { analysis, score })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        reply: String,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatModel for Recorder {
        async fn complete(&self, system: &str, user: &str) -> Result<String, EvaluateError> {
            self.seen.lock().unwrap().push((system.to_string(), user.to_string()));
            Ok(self.reply.clone())
        }
    }

    fn recorder(reply: &str) -> Recorder {
        Recorder {
            reply: reply.into(),
            seen: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn truncates_transcript_to_budget() {
        let model = recorder("Calificación final: 4/5");
        let cfg = EvaluatorConfig {
            max_transcript_chars: 10,
            ..EvaluatorConfig::for_rubric(Rubric::Full)
        };
        let eval = evaluate(&model, &cfg, "áéíóú áéíóú áéíóú").await.unwrap();
        assert_eq!(eval.score, 4.0);

        let seen = model.seen.lock().unwrap();
        assert_eq!(seen[0].1, "áéíóú áéíó");
        assert!(seen[0].0.starts_with("Eres un experto en feedback"));
    }

    #[tokio::test]
    async fn brief_rubric_uses_checkmarks_without_delimiter() {
        let model = recorder("1. ✅\n2. ✅\n3. ❌\nPuntuación 2");
        let cfg = EvaluatorConfig::for_rubric(Rubric::Brief);
        let eval = evaluate(&model, &cfg, "hola").await.unwrap();
        assert_eq!(eval.score, 2.0);
        assert_eq!(eval.analysis, "1. ✅\n2. ✅\n3. ❌\nPuntuación 2");
    }

    #[tokio::test]
    async fn zero_budget_sends_everything() {
        let model = recorder("PUNTAJE_FINAL: 5/5");
        let cfg = EvaluatorConfig {
            max_transcript_chars: 0,
            ..EvaluatorConfig::default()
        };
        let long = "a".repeat(20_000);
        let eval = evaluate(&model, &cfg, &long).await.unwrap();
        assert_eq!(eval.score, 5.0);
        assert_eq!(model.seen.lock().unwrap()[0].1.len(), 20_000);
    }
}
