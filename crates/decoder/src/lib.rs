//! Decoder: symphonia-based decoding of recordings to 16 kHz mono PCM.

use rubato::{FftFixedIn, Resampler};
use std::fs::File;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, instrument};

/// Sample rate handed to the speech backend.
pub const TARGET_RATE: u32 = 16_000;

const RESAMPLER_CHUNK: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("cannot open audio file: {0}")]
    Io(#[from] std::io::Error),
    #[error("unrecognised audio format: {0}")]
    Format(String),
    #[error("no decodable audio track")]
    NoTrack,
    #[error("decoder failure: {0}")]
    Codec(String),
    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Mono PCM samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmAudio {
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    /// Little-endian signed 16-bit PCM (LINEAR16).
    pub fn to_linear16(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &s in &self.samples {
            let v = (s * 32767.0).clamp(-32768.0, 32767.0) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Consecutive windows of at most `max_secs`, each a standalone clip.
    pub fn windows(&self, max_secs: f32) -> Vec<PcmAudio> {
        let per = ((max_secs * self.sample_rate as f32) as usize).max(1);
        self.samples
            .chunks(per)
            .map(|c| PcmAudio {
                samples: c.to_vec(),
                sample_rate: self.sample_rate,
            })
            .collect()
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Result of the ambient-noise pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// RMS level of the lead-in.
    pub noise_floor: f32,
    pub skipped_secs: f32,
}

/// Measure the first `secs` of audio as ambient noise and drop it from the
/// clip, the way a recognizer's calibration pass consumes its lead-in.
pub fn calibrate_ambient(audio: &mut PcmAudio, secs: f32) -> Calibration {
    let n = ((secs.max(0.0) * audio.sample_rate as f32) as usize).min(audio.samples.len());
    let noise_floor = rms(&audio.samples[..n]);
    audio.samples.drain(..n);
    Calibration {
        noise_floor,
        skipped_secs: n as f32 / audio.sample_rate.max(1) as f32,
    }
}

/// Decode the first audio track of `path`, downmix to mono and resample to
/// [`TARGET_RATE`].
#[instrument]
pub fn decode_to_pcm(path: &Path) -> Result<PcmAudio, DecodeError> {
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::Format(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoTrack)?;
    let track_id = track.id;
    let source_rate = track.codec_params.sample_rate.unwrap_or(TARGET_RATE);
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Codec(e.to_string()))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            // End of stream, or a chained stream we do not follow.
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Codec(e.to_string())),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let channels = decoded.spec().channels.count().max(1);
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                buf.copy_interleaved_ref(decoded);
                for frame in buf.samples().chunks(channels) {
                    mono.push(frame.iter().sum::<f32>() / frame.len() as f32);
                }
            }
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(DecodeError::Codec(e.to_string())),
        }
    }

    let samples = resample(&mono, source_rate, TARGET_RATE)?;
    debug!(source_rate, frames = mono.len(), out = samples.len(), "decoded recording");
    Ok(PcmAudio {
        samples,
        sample_rate: TARGET_RATE,
    })
}

/// Band-limited resampling; the FFT resampler low-passes before
/// decimating, so 44.1/48 kHz sources do not alias into the speech band.
fn resample(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>, DecodeError> {
    if from == to || input.is_empty() || from == 0 {
        return Ok(input.to_vec());
    }
    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLER_CHUNK, 1, 1)
        .map_err(|e| DecodeError::Resample(e.to_string()))?;
    // The block size is rounded to the rate ratio, so it may differ from the request.
    let chunk = resampler.input_frames_next();
    let delay = resampler.output_delay();
    let expected = (input.len() as f64 * to as f64 / from as f64).round() as usize;

    let mut output = Vec::with_capacity(expected + delay + resampler.output_frames_max());
    let mut chunks = input.chunks(chunk);
    let mut padded = vec![0.0f32; chunk];
    // Zero chunks after the tail flush the filter delay.
    while output.len() < expected + delay {
        let block: &[f32] = match chunks.next() {
            Some(c) if c.len() == chunk => c,
            Some(c) => {
                padded[..c.len()].copy_from_slice(c);
                padded[c.len()..].fill(0.0);
                &padded
            }
            None => {
                padded.fill(0.0);
                &padded
            }
        };
        let out = resampler
            .process(&[block], None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        match out.into_iter().next() {
            Some(ch) if !ch.is_empty() => output.extend_from_slice(&ch),
            _ => break,
        }
    }

    let start = delay.min(output.len());
    let end = (start + expected).min(output.len());
    Ok(output[start..end].to_vec())
}
