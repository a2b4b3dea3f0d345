//! Binary runner
//!
//! Initializes logging, creates one session and bridges it to the terminal:
//! stdin lines become input or commands, forwarded events go to stdout as
//! JSON lines.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cli::Cli;
use crate::manager::{
    CreateRequest, GitWorktrees, HubEvent, ManagerOutcome, SessionManager, WorktreeOptions,
};
use crate::tracing::ErrorTraceExt;
use crate::types::HubConfig;

#[cfg(feature = "otel")]
use opentelemetry::global;
#[cfg(feature = "otel")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::trace::SdkTracerProvider;

// Kept for flushing on shutdown
#[cfg(feature = "otel")]
static OTEL_PROVIDER: std::sync::OnceLock<SdkTracerProvider> = std::sync::OnceLock::new();

/// Flush and shut down the OpenTelemetry provider
#[cfg(feature = "otel")]
pub fn shutdown_otel() {
    if let Some(provider) = OTEL_PROVIDER.get() {
        tracing::info!("Shutting down OpenTelemetry provider...");
        if let Err(e) = provider.shutdown() {
            eprintln!("Failed to shutdown OpenTelemetry provider: {:?}", e);
        }
    }
}

/// No-op when the otel feature is disabled
#[cfg(not(feature = "otel"))]
pub fn shutdown_otel() {}

#[cfg(feature = "otel")]
fn init_otel(endpoint: &str, service_name: &str) -> anyhow::Result<SdkTracerProvider> {
    use opentelemetry_sdk::Resource;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(
            Resource::builder()
                .with_service_name(service_name.to_owned())
                .build(),
        )
        .build();

    global::set_tracer_provider(provider.clone());

    Ok(provider)
}

/// Build an EnvFilter based on CLI args and RUST_LOG environment variable
///
/// Priority: RUST_LOG environment variable > CLI arguments (-v, -vv, -q)
fn build_env_filter(cli: &Cli) -> tracing_subscriber::EnvFilter {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if !rust_log.is_empty() {
            return tracing_subscriber::EnvFilter::new(rust_log);
        }
    }

    let level = cli.log_level();
    tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into())
}

/// Install the subscriber with a formatting layer and, if enabled, OTLP export
fn install<W>(cli: &Cli, writer: W) -> anyhow::Result<()>
where
    W: for<'a> tracing_subscriber::fmt::MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = build_env_filter(cli);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = cli.otel_endpoint.as_deref().filter(|_| cli.is_otel_enabled()) {
            let service_name = &cli.otel_service_name;
            eprintln!(
                "OpenTelemetry enabled: endpoint={}, service={}",
                endpoint, service_name
            );

            let provider = init_otel(endpoint, service_name)?;
            let tracer = provider.tracer("agent-hub");
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            drop(OTEL_PROVIDER.set(provider));

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(otel_layer)
                .init();
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
    Ok(())
}

/// Initialize logging based on CLI arguments
///
/// stdout carries events, so logs go to stderr or, in diagnostic mode, a file.
fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    if !cli.is_diagnostic() {
        return install(cli, std::io::stderr);
    }

    let log_path = cli.log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(&log_path)?;
    eprintln!("Diagnostic mode: logging to {}", log_path.display());
    install(cli, std::sync::Mutex::new(file))
}

/// One line of terminal input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Input(String),
    Approve,
    ApproveAlways,
    Reject(Option<String>),
    Interrupt,
    Rewind(String),
    History,
    List,
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Input(line.to_string()));
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim().to_string()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };
        Some(match (name, arg) {
            ("approve", _) => Self::Approve,
            ("always", _) => Self::ApproveAlways,
            ("reject", message) => Self::Reject(message),
            ("interrupt", _) => Self::Interrupt,
            ("rewind", Some(uuid)) => Self::Rewind(uuid),
            ("history", _) => Self::History,
            ("list", _) => Self::List,
            ("quit" | "exit", _) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        })
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "Failed to serialize output"),
    }
}

fn report<T>(outcome: ManagerOutcome<T>) -> Option<T> {
    match outcome.into_result() {
        Ok(value) => Some(value),
        Err(e) => {
            e.trace_error();
            eprintln!("{e}");
            None
        }
    }
}

/// Execute one command; returns false when the loop should end
async fn execute(manager: &SessionManager, id: &str, command: Command) -> bool {
    match command {
        Command::Input(text) => {
            report(manager.send_input(id, text, Vec::new()));
        }
        Command::Approve => {
            if report(manager.approve(id, None, None).await) == Some(false) {
                eprintln!("nothing to approve");
            }
        }
        Command::ApproveAlways => {
            if report(manager.approve_always(id, None).await) == Some(false) {
                eprintln!("nothing to approve");
            }
        }
        Command::Reject(message) => {
            if report(manager.reject(id, None, message).await) == Some(false) {
                eprintln!("nothing to reject");
            }
        }
        Command::Interrupt => {
            if let Some(Err(e)) = report(manager.interrupt(id).await) {
                e.trace_error();
            }
        }
        Command::Rewind(uuid) => {
            if let Some(Err(e)) = report(manager.rewind(id, &uuid).await) {
                eprintln!("{e}");
            }
        }
        Command::History => {
            if let Some(history) = report(manager.history(id)) {
                print_json(&history);
            }
        }
        Command::List => print_json(&manager.list()),
        Command::Quit => return false,
        Command::Unknown(line) => eprintln!("unknown command: {line}"),
    }
    true
}

async fn drive(
    manager: &SessionManager,
    id: &str,
    mut events: mpsc::UnboundedReceiver<HubEvent>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("stdin closed");
                    return Ok(());
                };
                if let Some(command) = Command::parse(&line) {
                    if !execute(manager, id, command).await {
                        return Ok(());
                    }
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                print_json(&event);
            }
        }
    }
}

/// Run the binary with parsed CLI arguments
pub async fn run_with_cli(cli: &Cli) -> anyhow::Result<()> {
    init_logging(cli)?;

    let config = HubConfig::from_env();
    tracing::info!(
        version = %env!("CARGO_PKG_VERSION"),
        pid = %std::process::id(),
        backend = %cli.backend,
        codex_path = %config.codex_path,
        "agent-hub starting"
    );

    let project = match &cli.project {
        Some(project) => project.clone(),
        None => std::env::current_dir()?,
    };
    let (manager, events) = SessionManager::builder()
        .config(config)
        .worktrees(Arc::new(GitWorktrees::new()))
        .build();

    let mut request = CreateRequest::new(project, cli.backend).with_options(cli.start_options());
    if cli.worktree {
        request = request.with_worktree(WorktreeOptions {
            create: true,
            branch: cli.branch.clone(),
            existing_path: None,
        });
    }

    let id = manager.create(request).await?;
    tracing::info!(session_id = %id, "Session created");

    let result = drive(&manager, &id, events).await;
    manager.shutdown().await;
    tracing::info!("agent-hub stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("  "), None);
        assert_eq!(
            Command::parse("fix the tests"),
            Some(Command::Input("fix the tests".to_string()))
        );
        assert_eq!(Command::parse("/approve"), Some(Command::Approve));
        assert_eq!(Command::parse("/reject"), Some(Command::Reject(None)));
        assert_eq!(
            Command::parse("/reject not that file"),
            Some(Command::Reject(Some("not that file".to_string())))
        );
        assert_eq!(
            Command::parse("/rewind u-1"),
            Some(Command::Rewind("u-1".to_string()))
        );
        assert_eq!(
            Command::parse("/rewind"),
            Some(Command::Unknown("/rewind".to_string()))
        );
        assert_eq!(Command::parse("/exit"), Some(Command::Quit));
    }
}
