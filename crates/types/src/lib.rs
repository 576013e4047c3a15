//! Shared data types for callgrade

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Characters of transcript kept by [`AnalysisResult::display_transcript`].
pub const DISPLAY_TRANSCRIPT_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("start {start} is after end {end}")]
    StartAfterEnd { start: String, end: String },
    #[error("date {0} has no representable local midnight")]
    Unrepresentable(NaiveDate),
}

/// Inclusive creation-time window, in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start_ms: i64,
    end_ms: i64,
}

impl DateRange {
    pub fn from_millis(start_ms: i64, end_ms: i64) -> Result<Self, RangeError> {
        if start_ms > end_ms {
            return Err(RangeError::StartAfterEnd {
                start: start_ms.to_string(),
                end: end_ms.to_string(),
            });
        }
        Ok(Self { start_ms, end_ms })
    }

    /// Widen two calendar dates to the local-time day boundaries
    /// `start 00:00:00.000 ..= end 23:59:59.999`.
    pub fn from_dates(start: NaiveDate, end: NaiveDate) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::StartAfterEnd {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        let start_ms = local_millis(start, NaiveTime::MIN)?;
        let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
        let end_ms = local_millis(end, end_of_day)?;
        Self::from_millis(start_ms, end_ms)
    }

    pub fn start_ms(&self) -> i64 {
        self.start_ms
    }

    pub fn end_ms(&self) -> i64 {
        self.end_ms
    }
}

fn local_millis(date: NaiveDate, time: NaiveTime) -> Result<i64, RangeError> {
    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp_millis())
        .ok_or(RangeError::Unrepresentable(date))
}

/// A CRM call object as seen by the locator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub recording_url: Option<String>,
}

impl CallRecord {
    /// The recording URL, if present and non-blank.
    pub fn recording_url(&self) -> Option<&str> {
        self.recording_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub call_id: String,
    pub created_at: DateTime<Utc>,
    pub transcript: String,
    pub analysis: String,
    pub score: f64,
}

impl AnalysisResult {
    /// Transcript shortened for tables: the first 300 characters plus `...`.
    pub fn display_transcript(&self) -> String {
        if self.transcript.chars().count() > DISPLAY_TRANSCRIPT_CHARS {
            let head: String = self.transcript.chars().take(DISPLAY_TRANSCRIPT_CHARS).collect();
            format!("{head}...")
        } else {
            self.transcript.clone()
        }
    }
}

/// Pipeline stage a call was dropped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Transcribe,
    Evaluate,
    Cancelled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Fetch => "fetch",
            Stage::Transcribe => "transcribe",
            Stage::Evaluate => "evaluate",
            Stage::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedCall {
    pub call_id: String,
    pub stage: Stage,
    pub reason: String,
}

/// Traffic-light band for a mean score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreBand {
    Green,
    Yellow,
    Red,
}

impl ScoreBand {
    pub fn for_score(score: f64) -> Self {
        if score >= 4.0 {
            ScoreBand::Green
        } else if score >= 2.5 {
            ScoreBand::Yellow
        } else {
            ScoreBand::Red
        }
    }
}

/// Outcome of one run: analysed calls in selection order plus the ones dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub results: Vec<AnalysisResult>,
    pub skipped: Vec<SkippedCall>,
}

impl RunSummary {
    pub fn mean_score(&self) -> Option<f64> {
        if self.results.is_empty() {
            return None;
        }
        let total: f64 = self.results.iter().map(|r| r.score).sum();
        Some(total / self.results.len() as f64)
    }

    pub fn band(&self) -> Option<ScoreBand> {
        self.mean_score().map(ScoreBand::for_score)
    }

    /// Number of results per rounded integer score.
    pub fn distribution(&self) -> BTreeMap<u8, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.results {
            let bucket = r.score.round().clamp(0.0, 5.0) as u8;
            *counts.entry(bucket).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, score: f64) -> AnalysisResult {
        AnalysisResult {
            call_id: id.into(),
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            transcript: "hola".into(),
            analysis: "ok".into(),
            score,
        }
    }

    #[test]
    fn json_roundtrip() {
        let r = result("101", 3.0);
        let s = serde_json::to_string(&r).unwrap();
        let back: AnalysisResult = serde_json::from_str(&s).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn range_rejects_start_after_end() {
        let a = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let b = NaiveDate::from_ymd_opt(2024, 5, 9).unwrap();
        assert!(matches!(
            DateRange::from_dates(a, b),
            Err(RangeError::StartAfterEnd { .. })
        ));
        assert!(DateRange::from_millis(10, 9).is_err());
    }

    #[test]
    fn single_day_range_spans_whole_day() {
        let d = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let r = DateRange::from_dates(d, d).unwrap();
        // 24h minus one millisecond, except on DST transition days
        let span = r.end_ms() - r.start_ms();
        assert!(span >= 23 * 3_600_000 - 1 && span <= 25 * 3_600_000 - 1);
    }

    #[test]
    fn blank_recording_url_is_absent() {
        let mut call = CallRecord {
            id: "1".into(),
            title: "t".into(),
            created_at: Utc::now(),
            recording_url: Some("   ".into()),
        };
        assert_eq!(call.recording_url(), None);
        call.recording_url = Some("https://x/rec.wav".into());
        assert_eq!(call.recording_url(), Some("https://x/rec.wav"));
    }

    #[test]
    fn display_transcript_truncates_long_text() {
        let mut r = result("1", 1.0);
        r.transcript = "ñ".repeat(301);
        let shown = r.display_transcript();
        assert!(shown.ends_with("..."));
        assert_eq!(shown.chars().count(), 303);

        r.transcript = "corto".into();
        assert_eq!(r.display_transcript(), "corto");
    }

    #[test]
    fn summary_mean_band_and_distribution() {
        let empty = RunSummary::default();
        assert_eq!(empty.mean_score(), None);
        assert_eq!(empty.band(), None);

        let s = RunSummary {
            results: vec![result("a", 5.0), result("b", 3.0), result("c", 3.0)],
            skipped: vec![],
        };
        let mean = s.mean_score().unwrap();
        assert!((mean - 11.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.band(), Some(ScoreBand::Yellow));
        let dist = s.distribution();
        assert_eq!(dist.get(&3), Some(&2));
        assert_eq!(dist.get(&5), Some(&1));
    }

    #[test]
    fn band_thresholds() {
        assert_eq!(ScoreBand::for_score(4.0), ScoreBand::Green);
        assert_eq!(ScoreBand::for_score(2.5), ScoreBand::Yellow);
        assert_eq!(ScoreBand::for_score(2.4), ScoreBand::Red);
    }
}
