//! Pipeline orchestrator: locate calls, then fetch, transcribe and grade each one.

use callgrade_crm::{locate_calls, CallSearch, CrmError, HubSpotClient};
use callgrade_evaluate::{evaluate, ChatModel, EvaluateError, EvaluatorConfig, GeminiClient};
use callgrade_fetcher::{FetchError, HttpRecordingFetcher, RecordingSource};
use callgrade_transcribe::{GoogleSpeechClient, SpeechOptions, SpeechToText, TranscribeError};
use callgrade_types::{AnalysisResult, CallRecord, DateRange, RangeError, RunSummary, SkippedCall, Stage};
use chrono::NaiveDate;
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Calls analysed when the user does not pick any.
pub const DEFAULT_SELECTION: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid date range: {0}")]
    InvalidRange(#[from] RangeError),
    #[error("HubSpot rejected the access token; check it and try again")]
    CrmUnauthorized,
    #[error("call search failed: {0}")]
    Crm(String),
    #[error("no calls selected")]
    EmptySelection,
    #[error("{requested} calls selected but at most {max} are allowed")]
    TooManySelected { requested: usize, max: usize },
    #[error("call {0} is not among the located calls")]
    UnknownCall(String),
    #[error("backend setup failed: {0}")]
    Setup(String),
}

impl From<CrmError> for PipelineError {
    fn from(e: CrmError) -> Self {
        match e {
            CrmError::Unauthorized => PipelineError::CrmUnauthorized,
            other => PipelineError::Crm(other.to_string()),
        }
    }
}

/// Session credentials, read by every stage and never written back anywhere.
#[derive(Clone)]
pub struct Credentials {
    pub hubspot_token: String,
    pub google_api_key: String,
    /// Key for the speech API; the Google key is used when absent.
    pub speech_api_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("hubspot_token", &"***")
            .field("google_api_key", &"***")
            .field("speech_api_key", &self.speech_api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    pub hubspot: String,
    pub speech: String,
    pub gemini: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            hubspot: callgrade_crm::DEFAULT_BASE_URL.to_string(),
            speech: callgrade_transcribe::DEFAULT_BASE_URL.to_string(),
            gemini: callgrade_evaluate::gemini::DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Worker-pool size and per-service concurrency caps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Limits {
    pub jobs: usize,
    pub downloads: usize,
    pub speech: usize,
    pub llm: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            jobs: 1,
            downloads: 2,
            speech: 2,
            llm: 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub evaluator: EvaluatorConfig,
    pub limits: Limits,
    pub max_selections: Option<usize>,
}

impl PipelineConfig {
    fn selection_cap(&self) -> usize {
        self.max_selections.unwrap_or(DEFAULT_SELECTION).max(1)
    }
}

/// The four external services the pipeline drives.
#[derive(Clone)]
pub struct Backends {
    pub crm: Arc<dyn CallSearch>,
    pub recordings: Arc<dyn RecordingSource>,
    pub speech: Arc<dyn SpeechToText>,
    pub model: Arc<dyn ChatModel>,
}

/// Options for building the production HTTP backends.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub endpoints: Endpoints,
    pub speech: SpeechOptions,
    pub gemini_model: String,
    pub llm_retries: u32,
    pub temp_dir: Option<PathBuf>,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            endpoints: Endpoints::default(),
            speech: SpeechOptions::default(),
            gemini_model: callgrade_evaluate::gemini::DEFAULT_MODEL.to_string(),
            llm_retries: 2,
            temp_dir: None,
        }
    }
}

impl Backends {
    pub fn from_credentials(creds: &Credentials, opts: &BackendOptions) -> Result<Self, PipelineError> {
        let crm = HubSpotClient::new(&opts.endpoints.hubspot, &creds.hubspot_token)
            .map_err(|e| PipelineError::Setup(e.to_string()))?;
        let mut recordings = HttpRecordingFetcher::new(&creds.hubspot_token)
            .map_err(|e| PipelineError::Setup(e.to_string()))?;
        if let Some(dir) = &opts.temp_dir {
            recordings = recordings.with_temp_dir(dir);
        }
        let speech_key = creds.speech_api_key.as_deref().unwrap_or(&creds.google_api_key);
        let speech = GoogleSpeechClient::new(&opts.endpoints.speech, speech_key, opts.speech.clone())
            .map_err(|e| PipelineError::Setup(e.to_string()))?;
        let model = GeminiClient::new(&opts.endpoints.gemini, &creds.google_api_key, &opts.gemini_model)
            .map_err(|e| PipelineError::Setup(e.to_string()))?
            .with_retries(opts.llm_retries, Duration::from_millis(500));

        Ok(Self {
            crm: Arc::new(crm),
            recordings: Arc::new(recordings),
            speech: Arc::new(speech),
            model: Arc::new(model),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Started { index: usize, total: usize, call_id: String },
    Stage { call_id: String, stage: Stage },
    Finished { call_id: String, ok: bool },
}

/// Receives per-call progress. Must be cheap; it is called inline.
pub trait Progress: Send + Sync {
    fn event(&self, ev: ProgressEvent);
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn event(&self, _ev: ProgressEvent) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The window holds no calls with recordings; nothing downstream ran.
    NoCalls,
    Analyzed {
        located: Vec<CallRecord>,
        summary: RunSummary,
    },
}

/// Pick the calls to analyse. An empty request takes the first
/// [`DEFAULT_SELECTION`]; an explicit one may not exceed `max` distinct ids.
pub fn select_calls(calls: &[CallRecord], requested: &[String], max: usize) -> Result<Vec<CallRecord>, PipelineError> {
    if requested.is_empty() {
        let picked: Vec<CallRecord> = calls.iter().take(DEFAULT_SELECTION.min(max)).cloned().collect();
        if picked.is_empty() {
            return Err(PipelineError::EmptySelection);
        }
        return Ok(picked);
    }
    let ids = distinct_ids(requested);
    check_selection_size(&ids, max)?;

    let mut picked: Vec<CallRecord> = Vec::with_capacity(ids.len());
    for id in ids {
        let call = calls
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| PipelineError::UnknownCall(id.to_string()))?;
        picked.push(call.clone());
    }
    Ok(picked)
}

/// Requested ids in first-seen order, duplicates dropped.
fn distinct_ids(requested: &[String]) -> Vec<&str> {
    let mut ids: Vec<&str> = Vec::with_capacity(requested.len());
    for id in requested {
        if !ids.contains(&id.as_str()) {
            ids.push(id.as_str());
        }
    }
    ids
}

fn check_selection_size(ids: &[&str], max: usize) -> Result<(), PipelineError> {
    if ids.len() > max {
        return Err(PipelineError::TooManySelected {
            requested: ids.len(),
            max,
        });
    }
    Ok(())
}

/// Validate the window, then list calls with recordings.
pub async fn locate(backends: &Backends, start: NaiveDate, end: NaiveDate) -> Result<Vec<CallRecord>, PipelineError> {
    let range = DateRange::from_dates(start, end)?;
    Ok(locate_calls(backends.crm.as_ref(), &range).await?)
}

/// Full run: validate, locate, select, analyse.
pub async fn run(
    backends: &Backends,
    cfg: &PipelineConfig,
    start: NaiveDate,
    end: NaiveDate,
    requested: &[String],
    cancel: CancellationToken,
    progress: &dyn Progress,
) -> Result<RunOutcome, PipelineError> {
    let range = DateRange::from_dates(start, end)?;
    let cap = cfg.selection_cap();
    check_selection_size(&distinct_ids(requested), cap)?;

    let located = locate_calls(backends.crm.as_ref(), &range).await?;
    if located.is_empty() {
        info!("no calls with recordings in range");
        return Ok(RunOutcome::NoCalls);
    }

    let selected = select_calls(&located, requested, cap)?;
    let summary = analyze_calls(backends, cfg, selected, cancel, progress).await;
    Ok(RunOutcome::Analyzed { located, summary })
}

struct Gates {
    downloads: Semaphore,
    speech: Semaphore,
    llm: Semaphore,
}

/// Stage a call stopped at and why.
type Skip = (Stage, String);

/// Analyse `calls` on a bounded worker pool. Results keep selection order.
/// Every per-call failure, credential rejections included, skips only that
/// call; cancelling `cancel` reports unfinished calls as skipped.
pub async fn analyze_calls(
    backends: &Backends,
    cfg: &PipelineConfig,
    calls: Vec<CallRecord>,
    cancel: CancellationToken,
    progress: &dyn Progress,
) -> RunSummary {
    let limits = cfg.limits;
    let gates = Gates {
        downloads: Semaphore::new(limits.downloads.max(1)),
        speech: Semaphore::new(limits.speech.max(1)),
        llm: Semaphore::new(limits.llm.max(1)),
    };
    let total = calls.len();
    info!(total, jobs = limits.jobs, "analysing calls");

    let outcomes: Vec<(String, Result<AnalysisResult, Skip>)> = stream::iter(calls.into_iter().enumerate())
        .map(|(index, call)| {
            let gates = &gates;
            let cancel = cancel.clone();
            let span = info_span!("call", id = %call.id);
            async move {
                progress.event(ProgressEvent::Started {
                    index,
                    total,
                    call_id: call.id.clone(),
                });
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err((Stage::Cancelled, "run cancelled".to_string())),
                    r = analyze_call(backends, &cfg.evaluator, gates, &call, progress) => r,
                };
                progress.event(ProgressEvent::Finished {
                    call_id: call.id.clone(),
                    ok: outcome.is_ok(),
                });
                (call.id, outcome)
            }
            .instrument(span)
        })
        .buffered(limits.jobs.max(1))
        .collect()
        .await;

    let mut summary = RunSummary::default();
    for (call_id, outcome) in outcomes {
        match outcome {
            Ok(result) => summary.results.push(result),
            Err((stage, reason)) => summary.skipped.push(SkippedCall {
                call_id,
                stage,
                reason,
            }),
        }
    }
    info!(
        analysed = summary.results.len(),
        skipped = summary.skipped.len(),
        mean = summary.mean_score(),
        "run finished"
    );
    summary
}

async fn analyze_call(
    backends: &Backends,
    eval_cfg: &EvaluatorConfig,
    gates: &Gates,
    call: &CallRecord,
    progress: &dyn Progress,
) -> Result<AnalysisResult, Skip> {
    let Some(url) = call.recording_url() else {
        return Err((Stage::Fetch, "call has no recording url".into()));
    };

    progress.event(ProgressEvent::Stage {
        call_id: call.id.clone(),
        stage: Stage::Fetch,
    });
    let fetched = {
        let _permit = gates.downloads.acquire().await;
        backends.recordings.fetch(url).await
    };
    let fetched = match fetched {
        Ok(f) => f,
        Err(e @ FetchError::Unauthorized(_)) => {
            error!(error = %e, "recording server rejected the HubSpot token, skipping call");
            return Err((Stage::Fetch, e.to_string()));
        }
        Err(e) => {
            warn!(error = %e, "download failed, skipping call");
            return Err((Stage::Fetch, e.to_string()));
        }
    };

    progress.event(ProgressEvent::Stage {
        call_id: call.id.clone(),
        stage: Stage::Transcribe,
    });
    let transcript = {
        let _permit = gates.speech.acquire().await;
        backends.speech.transcribe(fetched.file.path()).await
    };
    if let Err(e) = fetched.file.release() {
        warn!(error = %e, "failed to remove temporary recording");
    }
    let transcript = match transcript {
        Ok(t) => t,
        Err(TranscribeError::Unintelligible) => {
            warn!("speech backend could not understand the audio (silence or low quality)");
            return Err((Stage::Transcribe, TranscribeError::Unintelligible.to_string()));
        }
        Err(e) => {
            error!(error = %e, "transcription failed, skipping call");
            return Err((Stage::Transcribe, e.to_string()));
        }
    };

    progress.event(ProgressEvent::Stage {
        call_id: call.id.clone(),
        stage: Stage::Evaluate,
    });
    let evaluation = {
        let _permit = gates.llm.acquire().await;
        evaluate(backends.model.as_ref(), eval_cfg, &transcript.text).await
    };
    let evaluation = match evaluation {
        Ok(ev) => ev,
        Err(e @ EvaluateError::Unauthorized(_)) => {
            error!(error = %e, "LLM provider rejected the API key, skipping call");
            return Err((Stage::Evaluate, e.to_string()));
        }
        Err(e) => {
            error!(error = %e, "analysis failed, skipping call");
            return Err((Stage::Evaluate, e.to_string()));
        }
    };

    Ok(AnalysisResult {
        call_id: call.id.clone(),
        created_at: call.created_at,
        transcript: transcript.text,
        analysis: evaluation.analysis,
        score: evaluation.score,
    })
}
