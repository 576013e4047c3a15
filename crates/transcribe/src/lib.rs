use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use callgrade_decoder::{calibrate_ambient, decode_to_pcm, DecodeError, PcmAudio};
use callgrade_utils::clip;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_BASE_URL: &str = "https://speech.googleapis.com";
pub const DEFAULT_LOCALE: &str = "es-ES";
/// The synchronous recognize endpoint accepts about a minute of audio.
pub const SYNC_WINDOW_SECS: f32 = 55.0;
pub const CALIBRATION_SECS: f32 = 0.5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    /// Silence or audio too poor to recognise.
    #[error("speech backend could not understand the audio")]
    Unintelligible,
    #[error("speech request failed: {0}")]
    Request(String),
    #[error("cannot decode recording: {0}")]
    Decode(#[from] DecodeError),
}

impl From<reqwest::Error> for TranscribeError {
    fn from(e: reqwest::Error) -> Self {
        TranscribeError::Request(e.to_string())
    }
}

/// Options for cloud recognition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechOptions {
    /// BCP-47 locale sent to the backend.
    pub locale: String,
    /// Length of the ambient-noise lead-in to measure and skip. `None` disables it.
    pub calibrate_secs: Option<f32>,
    /// Longest clip sent in one request.
    pub window_secs: f32,
}

impl Default for SpeechOptions {
    fn default() -> Self {
        Self {
            locale: DEFAULT_LOCALE.to_string(),
            calibrate_secs: Some(CALIBRATION_SECS),
            window_secs: SYNC_WINDOW_SECS,
        }
    }
}

/// Audio file in, plain text out.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, path: &Path) -> Result<Transcript, TranscribeError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'static str,
    sample_rate_hertz: u32,
    language_code: &'a str,
    audio_channel_count: u16,
}

#[derive(Debug, Serialize)]
struct RecognitionAudio {
    content: String,
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    config: RecognitionConfig<'a>,
    audio: RecognitionAudio,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<SpeechResult>,
}

#[derive(Debug, Deserialize)]
struct SpeechResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

/// Google Cloud Speech-to-Text v1 `speech:recognize` client.
#[derive(Debug, Clone)]
pub struct GoogleSpeechClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    opts: SpeechOptions,
}

impl GoogleSpeechClient {
    pub fn new(base_url: &str, api_key: &str, opts: SpeechOptions) -> Result<Self, TranscribeError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.trim().to_string(),
            client,
            opts,
        })
    }

    async fn recognize(&self, clip_audio: &PcmAudio) -> Result<String, TranscribeError> {
        let url = format!("{}/v1/speech:recognize", self.base_url);
        let body = RecognizeRequest {
            config: RecognitionConfig {
                encoding: "LINEAR16",
                sample_rate_hertz: clip_audio.sample_rate,
                language_code: &self.opts.locale,
                audio_channel_count: 1,
            },
            audio: RecognitionAudio {
                content: STANDARD.encode(clip_audio.to_linear16()),
            },
        };

        let resp = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(TranscribeError::Request(format!("HTTP {}: {}", status.as_u16(), clip(&text))));
        }

        let parsed: RecognizeResponse = serde_json::from_str(&text)
            .map_err(|e| TranscribeError::Request(format!("malformed response: {e}")))?;
        let pieces: Vec<&str> = parsed
            .results
            .iter()
            .filter_map(|r| r.alternatives.first())
            .map(|a| a.transcript.trim())
            .filter(|t| !t.is_empty())
            .collect();
        Ok(pieces.join(" "))
    }
}

#[async_trait]
impl SpeechToText for GoogleSpeechClient {
    #[instrument(skip(self), fields(locale = %self.opts.locale))]
    async fn transcribe(&self, path: &Path) -> Result<Transcript, TranscribeError> {
        let owned: PathBuf = path.to_path_buf();
        let mut pcm = tokio::task::spawn_blocking(move || decode_to_pcm(&owned))
            .await
            .map_err(|e| TranscribeError::Request(format!("decoder task failed: {e}")))??;

        if let Some(secs) = self.opts.calibrate_secs {
            let cal = calibrate_ambient(&mut pcm, secs);
            debug!(noise_floor = cal.noise_floor, skipped_secs = cal.skipped_secs, "ambient calibration");
        }
        if pcm.is_empty() {
            warn!("recording has no audio after calibration");
            return Err(TranscribeError::Unintelligible);
        }

        let windows = pcm.windows(self.opts.window_secs);
        info!(secs = pcm.duration_secs(), windows = windows.len(), "sending audio for recognition");
        let mut parts = Vec::with_capacity(windows.len());
        for w in &windows {
            let text = self.recognize(w).await?;
            if !text.is_empty() {
                parts.push(text);
            }
        }

        if parts.is_empty() {
            return Err(TranscribeError::Unintelligible);
        }
        Ok(Transcript { text: parts.join(" ") })
    }
}
