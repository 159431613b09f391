//! Pipeline progress reporting.
//!
//! The orchestrator invokes a [`StageReporter`] after every stage
//! transition with the stage name and fractional completion, for UI status
//! polling. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;

use docgraph_core::models::Stage;

/// Receives stage transitions from the orchestrator.
pub trait StageReporter: Send + Sync {
    /// Called after a stage completes. `fraction` is in `[0, 1]`.
    fn report(&self, stage: Stage, fraction: f64);
}

/// Human-friendly progress on stderr: `"process  ExtractConcepts  65%"`.
pub struct StderrProgress;

impl StageReporter for StderrProgress {
    fn report(&self, stage: Stage, fraction: f64) {
        let line = format!(
            "process  {}  {}%\n",
            stage.as_str(),
            (fraction * 100.0).round() as u32
        );
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl StageReporter for JsonProgress {
    fn report(&self, stage: Stage, fraction: f64) {
        let obj = serde_json::json!({
            "event": "progress",
            "stage": stage.as_str(),
            "fraction": fraction,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl StageReporter for NoProgress {
    fn report(&self, _stage: Stage, _fraction: f64) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn StageReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
