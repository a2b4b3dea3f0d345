//! Command-line interface definitions
//!
//! Provides CLI argument parsing using clap for the agent-hub binary.

use std::path::PathBuf;

use clap::Parser;

use crate::types::{BackendKind, CollaborationMode, StartOptions};

/// agent-hub - drive one coding-agent session from the terminal
///
/// Lines read from stdin are sent as input. Lines starting with `/` are
/// commands: /approve, /always, /reject [msg], /interrupt, /rewind <uuid>,
/// /history, /list, /quit. Every forwarded event is printed to stdout as
/// one JSON line.
#[derive(Parser, Debug, Clone)]
#[command(name = "agent-hub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Backend to drive (claude or codex)
    #[arg(short, long, default_value = "claude", value_parser = parse_backend)]
    pub backend: BackendKind,

    /// Project directory (defaults to the current directory)
    #[arg(short, long, value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// Model identifier
    #[arg(short, long)]
    pub model: Option<String>,

    /// Reasoning effort (low, medium, high)
    #[arg(long)]
    pub effort: Option<String>,

    /// Permission / approval mode passed to the backend
    #[arg(long)]
    pub permission_mode: Option<String>,

    /// Start in plan collaboration mode (codex)
    #[arg(long)]
    pub plan: bool,

    /// Resume a backend session / thread id
    #[arg(short, long, value_name = "ID")]
    pub resume: Option<String>,

    /// Run the session in a new git worktree
    #[arg(long)]
    pub worktree: bool,

    /// Branch for the new worktree
    #[arg(long, requires = "worktree")]
    pub branch: Option<String>,

    /// Enable diagnostic mode (auto-log to temp file)
    #[arg(short, long)]
    pub diagnostic: bool,

    /// Log directory (implies diagnostic mode)
    #[arg(short = 'l', long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log file name (implies diagnostic mode)
    #[arg(short = 'f', long, value_name = "FILE")]
    pub log_file: Option<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    /// Note: RUST_LOG env var takes priority over this flag
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only errors)
    /// Note: RUST_LOG env var takes priority over this flag
    #[arg(short, long)]
    pub quiet: bool,

    /// OpenTelemetry OTLP endpoint (e.g., http://localhost:4317)
    /// When otel feature is enabled, this configures the OTLP exporter.
    /// When otel feature is disabled, this argument is accepted but ignored.
    #[arg(long, value_name = "URL", env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otel_endpoint: Option<String>,

    /// OpenTelemetry service name
    #[arg(long, value_name = "NAME", default_value = "agent-hub")]
    pub otel_service_name: String,
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    BackendKind::parse(s).ok_or_else(|| format!("unknown backend '{s}' (expected claude or codex)"))
}

#[allow(clippy::derivable_impls)]
impl Default for Cli {
    fn default() -> Self {
        Self {
            backend: BackendKind::Claude,
            project: None,
            model: None,
            effort: None,
            permission_mode: None,
            plan: false,
            resume: None,
            worktree: false,
            branch: None,
            diagnostic: false,
            log_dir: None,
            log_file: None,
            verbose: 0,
            quiet: false,
            otel_endpoint: None,
            otel_service_name: "agent-hub".to_string(),
        }
    }
}

impl Cli {
    /// Check if diagnostic mode is enabled (output to file)
    ///
    /// Returns true if `--diagnostic` is set, or if `--log-dir` or `--log-file` is specified.
    pub fn is_diagnostic(&self) -> bool {
        self.diagnostic || self.log_dir.is_some() || self.log_file.is_some()
    }

    /// Check if OpenTelemetry tracing is enabled
    #[cfg(feature = "otel")]
    pub fn is_otel_enabled(&self) -> bool {
        self.otel_endpoint.is_some()
    }

    /// Always false without the otel feature
    #[cfg(not(feature = "otel"))]
    pub fn is_otel_enabled(&self) -> bool {
        if self.otel_endpoint.is_some() {
            tracing::warn!("--otel-endpoint specified but otel feature is not enabled, ignoring");
        }
        false
    }

    /// Get the log level based on CLI arguments
    ///
    /// - `--quiet`: ERROR
    /// - default: INFO
    /// - `-v`: DEBUG
    /// - `-vv` or more: TRACE
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }

    /// Get the log file path for diagnostic mode
    ///
    /// Defaults to `agent-hub-{timestamp}.log` in the system temp directory.
    pub fn log_path(&self) -> PathBuf {
        let dir = self
            .log_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        let filename = self.log_file.clone().unwrap_or_else(|| {
            let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            format!("agent-hub-{timestamp}.log")
        });

        dir.join(filename)
    }

    /// Session start options from the flags
    pub fn start_options(&self) -> StartOptions {
        StartOptions {
            model: self.model.clone(),
            effort: self.effort.clone(),
            permission_mode: self.permission_mode.clone(),
            collaboration_mode: if self.plan {
                CollaborationMode::Plan
            } else {
                CollaborationMode::Default
            },
            resume: self.resume.clone(),
            ..Default::default()
        }
    }
}
