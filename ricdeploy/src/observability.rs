//! Logging setup and operator-facing diagnostics.
//!
//! Structured logs go through `tracing`. Independently of the log level, every
//! stage outcome is printed as a short tagged line on stderr so the operator
//! sees which step failed before being asked anything.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{IsTerminal, Write};
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::errors::DeployError;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(DeployError::config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_tracing(level: &str, format: LogFormat) -> Result<(), DeployError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("ricdeploy={level},ricdeploy_cli={level}")))
        .map_err(|e| DeployError::config(format!("invalid log level '{level}': {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| DeployError::config(format!("cannot install log subscriber: {e}")))
}

/// Diagnostic line tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Step succeeded.
    Ok,
    /// Step failed.
    Fail,
    /// Something needs attention.
    Warn,
    /// Step is starting.
    Step,
}

impl Tag {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "[ OK ]",
            Self::Fail => "[FAIL]",
            Self::Warn => "[WARN]",
            Self::Step => "[ .. ]",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Ok => "\x1b[32m",
            Self::Fail => "\x1b[31m",
            Self::Warn => "\x1b[33m",
            Self::Step => "\x1b[36m",
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone)]
enum Target {
    Stderr { color: bool },
    Memory(Arc<Mutex<Vec<String>>>),
    Silent,
}

/// Prints tagged step diagnostics.
#[derive(Clone)]
pub struct Diagnostics {
    target: Target,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::stderr()
    }
}

impl Diagnostics {
    /// Writes to stderr, colored when stderr is a terminal.
    #[must_use]
    pub fn stderr() -> Self {
        Self {
            target: Target::Stderr {
                color: std::io::stderr().is_terminal(),
            },
        }
    }

    /// Keeps lines in memory; see [`Diagnostics::lines`].
    #[must_use]
    pub fn capture() -> Self {
        Self {
            target: Target::Memory(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// Discards everything.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            target: Target::Silent,
        }
    }

    /// Captured lines; empty unless created with [`Diagnostics::capture`].
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match &self.target {
            Target::Memory(lines) => lines.lock().clone(),
            _ => Vec::new(),
        }
    }

    /// Prints `message` for `step` under `tag`.
    pub fn report(&self, tag: Tag, step: &str, message: &str) {
        let line = if message.is_empty() {
            format!("{tag} {step}")
        } else {
            format!("{tag} {step}: {message}")
        };
        match &self.target {
            Target::Stderr { color } => {
                let mut stderr = std::io::stderr().lock();
                let _ = if *color {
                    writeln!(stderr, "{}{}\x1b[0m{}", tag.color(), tag.label(), &line[tag.label().len()..])
                } else {
                    writeln!(stderr, "{line}")
                };
            }
            Target::Memory(lines) => lines.lock().push(line),
            Target::Silent => {}
        }
    }

    /// Reports a successful step.
    pub fn ok(&self, step: &str, message: &str) {
        self.report(Tag::Ok, step, message);
    }

    /// Reports a failed step.
    pub fn fail(&self, step: &str, message: &str) {
        self.report(Tag::Fail, step, message);
    }

    /// Reports a warning.
    pub fn warn(&self, step: &str, message: &str) {
        self.report(Tag::Warn, step, message);
    }

    /// Reports a step starting.
    pub fn step(&self, step: &str) {
        self.report(Tag::Step, step, "");
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.target {
            Target::Stderr { .. } => "stderr",
            Target::Memory(_) => "memory",
            Target::Silent => "silent",
        };
        f.debug_struct("Diagnostics").field("target", &kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_capture_tags_lines() {
        let diagnostics = Diagnostics::capture();
        diagnostics.step("onboard");
        diagnostics.fail("onboard", "HTTP 400");
        diagnostics.ok("verify-pod", "");

        assert_eq!(
            diagnostics.lines(),
            vec!["[ .. ] onboard", "[FAIL] onboard: HTTP 400", "[ OK ] verify-pod"]
        );
    }

    #[test]
    fn test_silent_keeps_nothing() {
        let diagnostics = Diagnostics::silent();
        diagnostics.warn("reclaim-ports", "port 8086 in use");
        assert!(diagnostics.lines().is_empty());
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
