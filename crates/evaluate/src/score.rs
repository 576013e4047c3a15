//! Score extraction from free-text LLM verdicts.
//!
//! The heuristics are lossy: a reply that lists unmet steps with ✅ in the
//! prose will inflate [`ScoreStrategy::Checkmarks`], and a reply that never
//! writes "calificación ... /5" scores 0 under [`ScoreStrategy::LineScan`].

use crate::rubric::SCORE_DELIMITER;
use serde::{Deserialize, Serialize};

const CHECKMARK: char = '✅';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreStrategy {
    /// First line mentioning "calificación" and "/5"; 0 when none parses.
    LineScan,
    /// Number of ✅ glyphs, clamped to 1..=5.
    Checkmarks,
}

impl ScoreStrategy {
    pub fn extract(self, reply: &str) -> f64 {
        match self {
            ScoreStrategy::LineScan => line_scan(reply),
            ScoreStrategy::Checkmarks => checkmarks(reply),
        }
    }
}

fn line_scan(reply: &str) -> f64 {
    for line in reply.lines() {
        if !line.to_lowercase().contains("calificación") || !line.contains("/5") {
            continue;
        }
        let Some(last) = line.split_whitespace().last() else {
            continue;
        };
        let head = last.split('/').next().unwrap_or_default();
        match head.parse::<f64>() {
            Ok(v) if v.is_finite() => return v.clamp(0.0, 5.0),
            _ => continue,
        }
    }
    0.0
}

fn checkmarks(reply: &str) -> f64 {
    reply.matches(CHECKMARK).count().clamp(1, 5) as f64
}

/// Value of the `PUNTAJE_FINAL: n/5` line, if the model emitted one.
/// Markdown emphasis anywhere on the line is ignored.
pub fn delimited(reply: &str) -> Option<f64> {
    reply.lines().rev().find_map(|line| {
        let plain: String = line.chars().filter(|c| !matches!(c, '*' | '`')).collect();
        let plain = plain.trim().trim_start_matches(|c: char| c == '-' || c == '#' || c.is_whitespace());
        let rest = plain.strip_prefix(SCORE_DELIMITER)?;
        let number = rest
            .trim()
            .split('/')
            .next()?
            .trim()
            .trim_matches('_')
            .replace(',', ".");
        number
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 5.0))
    })
}

/// Structured line first when requested, the heuristic otherwise.
pub fn score_reply(reply: &str, strategy: ScoreStrategy, structured: bool) -> f64 {
    if structured {
        if let Some(v) = delimited(reply) {
            return v;
        }
    }
    strategy.extract(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_scan_reads_score_before_slash() {
        assert_eq!(ScoreStrategy::LineScan.extract("Calificación final: 4/5"), 4.0);
        let reply = "1. Apertura ✅\n\n**CALIFICACIÓN: 3.5/5**\nSugerencias...";
        // last token is "3.5/5**", head "3.5"
        assert_eq!(ScoreStrategy::LineScan.extract(reply), 3.5);
    }

    #[test]
    fn line_scan_defaults_to_zero() {
        assert_eq!(ScoreStrategy::LineScan.extract("Puntuación: 4/5"), 0.0);
        assert_eq!(ScoreStrategy::LineScan.extract("Calificación: cuatro"), 0.0);
        assert_eq!(ScoreStrategy::LineScan.extract(""), 0.0);
    }

    #[test]
    fn line_scan_skips_unparseable_lines() {
        let reply = "Calificación: 4/5 (muy buena)\nCalificación final: 2/5";
        assert_eq!(ScoreStrategy::LineScan.extract(reply), 2.0);
    }

    #[test]
    fn checkmarks_are_clamped() {
        assert_eq!(ScoreStrategy::Checkmarks.extract(&"✅ ".repeat(6)), 5.0);
        assert_eq!(ScoreStrategy::Checkmarks.extract("❌ nada"), 1.0);
        assert_eq!(ScoreStrategy::Checkmarks.extract("✅ a\n✅ b\n❌ c\n✅ d"), 3.0);
    }

    #[test]
    fn delimited_line_wins_when_structured() {
        let reply = "✅ uno\n✅ dos\nCalificación: 1/5\n**PUNTAJE_FINAL: 4/5**";
        assert_eq!(delimited(reply), Some(4.0));
        assert_eq!(score_reply(reply, ScoreStrategy::Checkmarks, true), 4.0);
        assert_eq!(score_reply(reply, ScoreStrategy::Checkmarks, false), 2.0);
        assert_eq!(score_reply(reply, ScoreStrategy::LineScan, false), 1.0);
    }

    #[test]
    fn delimited_ignores_markdown_emphasis() {
        assert_eq!(delimited("**PUNTAJE_FINAL:** 4/5"), Some(4.0));
        assert_eq!(delimited("PUNTAJE_FINAL: **4/5**"), Some(4.0));
        assert_eq!(delimited("- `PUNTAJE_FINAL:` __3.5__/5"), Some(3.5));
        assert_eq!(delimited("### PUNTAJE_FINAL: 2/5"), Some(2.0));
        assert_eq!(score_reply("✅ a\n**PUNTAJE_FINAL:** 4/5", ScoreStrategy::LineScan, true), 4.0);
    }

    #[test]
    fn delimited_falls_back_to_heuristic() {
        assert_eq!(delimited("PUNTAJE_FINAL: n/5"), None);
        assert_eq!(delimited("PUNTAJE_FINAL: 3,5/5"), Some(3.5));
        assert_eq!(score_reply("sin puntaje", ScoreStrategy::Checkmarks, true), 1.0);
        assert_eq!(score_reply("PUNTAJE_FINAL: 9/5", ScoreStrategy::LineScan, true), 5.0);
    }
}
