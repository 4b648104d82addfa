// crates/core/src/progress.rs
//! Heuristic parsing of executor output lines into progress snapshots.
//!
//! Everything here is a pure function of one line of text. The matching is
//! substring/regex based, not a grammar: wording changes in the executor's
//! output can produce false negatives, never panics.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

/// Processing stage hinted at by an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Downloading,
    Merging,
    Converting,
    ExtractingAudio,
    EmbeddingSubs,
    PostProcessing,
}

impl Stage {
    /// Hub event name a line in this stage is published under.
    pub fn event_name(&self) -> &'static str {
        match self {
            Stage::Downloading => "progress",
            Stage::Merging => "merging",
            Stage::Converting => "converting",
            Stage::ExtractingAudio => "extracting",
            Stage::EmbeddingSubs => "embedding",
            Stage::PostProcessing => "postprocessing",
        }
    }

    /// Human-readable label stored on the job.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Downloading => "downloading",
            Stage::Merging => "merging",
            Stage::Converting => "converting",
            Stage::ExtractingAudio => "extracting audio",
            Stage::EmbeddingSubs => "embedding subtitles",
            Stage::PostProcessing => "post-processing",
        }
    }
}

/// Ordered (needle, stage) pairs. Earlier entries win, so the specific
/// post-processor tags come before the generic `[download]` tag.
const STAGE_HINTS: &[(&str, Stage)] = &[
    ("[merger]", Stage::Merging),
    ("merging formats", Stage::Merging),
    ("[extractaudio]", Stage::ExtractingAudio),
    ("extracting audio", Stage::ExtractingAudio),
    ("[embedsubtitle]", Stage::EmbeddingSubs),
    ("embedding subtitles", Stage::EmbeddingSubs),
    ("[videoconvertor]", Stage::Converting),
    ("[videoremuxer]", Stage::Converting),
    ("converting", Stage::Converting),
    ("remuxing", Stage::Converting),
    ("[fixup", Stage::PostProcessing),
    ("post-process", Stage::PostProcessing),
    ("[download]", Stage::Downloading),
];

/// Fields recognized on one output line. Any subset may be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.percent.is_none() && self.speed.is_none() && self.eta.is_none() && self.stage.is_none()
    }

    /// Hub event name for this update.
    pub fn event_name(&self) -> &'static str {
        self.stage.map(|s| s.event_name()).unwrap_or("progress")
    }
}

fn percent_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{1,3}(?:\.\d+)?)\s*%").ok())
        .as_ref()
}

fn speed_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?\s*(?:[KMGTkmgt]i?)?(?:B|b|bit|bits))/s").ok())
        .as_ref()
}

fn eta_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,2}:\d{2}(?::\d{2})?)\b").ok())
        .as_ref()
}

/// Detect a stage hint by case-insensitive substring match.
pub fn detect_stage(line: &str) -> Option<Stage> {
    let lower = line.to_ascii_lowercase();
    STAGE_HINTS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, stage)| *stage)
}

/// Parse one line of executor output.
pub fn parse_progress(line: &str) -> ProgressUpdate {
    let percent = percent_regex()
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f32>().ok())
        .map(|p| p.clamp(0.0, 100.0));

    let speed = speed_regex()
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace(' ', "") + "/s");

    let eta = eta_regex()
        .and_then(|re| re.captures(line))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    ProgressUpdate {
        percent,
        speed,
        eta,
        stage: detect_stage(line),
    }
}
