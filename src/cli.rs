use crate::client::ApiClient;
use crate::model::{AnalysisStatus, ClientConfig, DownloadFormat, PollEvent, PredictRequest};
use crate::orchestrator::{self, WatchConfig, WatchEnd};
use crate::poller::Poller;
use crate::text_summary::{self, TextSummary};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

type OutputTx = mpsc::UnboundedSender<OutputLine>;

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (OutputTx, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "reviewscope",
    version,
    about = "Submit product reviews for analysis and follow them to completion"
)]
pub struct Cli {
    /// Base URL of the review analysis service
    #[arg(
        long,
        global = true,
        env = "REVIEWSCOPE_BASE_URL",
        default_value = "http://localhost:8000"
    )]
    pub base_url: String,

    /// Per-request timeout
    #[arg(long, global = true, env = "REVIEWSCOPE_TIMEOUT", default_value = "30s")]
    pub timeout: humantime::Duration,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    /// Log debug details to stderr (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Poll an analysis until it completes or fails
    Watch {
        analysis_id: String,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Upload a review file and queue it for analysis
    Submit {
        file: PathBuf,
        /// Keep polling the new analysis until it settles
        #[arg(long)]
        watch: bool,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// List past analyses
    List,
    /// Show the current state of one analysis
    Show { analysis_id: String },
    /// Classify a single review
    Predict(PredictArgs),
    /// Download the report of a completed analysis
    Download {
        analysis_id: String,
        #[arg(long, value_enum, default_value_t = DownloadFormat::Csv)]
        format: DownloadFormat,
        /// Destination file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Args, Clone)]
pub struct PollArgs {
    /// Delay between the end of one status check and the start of the next
    #[arg(long, default_value = "2s")]
    pub interval: humantime::Duration,

    /// Back off after failed checks, doubling the delay up to this bound
    #[arg(long)]
    pub max_interval: Option<humantime::Duration>,

    /// Download the report in this format once the analysis completes
    #[arg(long, value_enum)]
    pub download: Option<DownloadFormat>,

    /// Destination file or directory for --download
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl PollArgs {
    fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            interval: Duration::from(self.interval),
            max_interval: self.max_interval.map(Duration::from),
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct PredictArgs {
    /// Review text to classify
    #[arg(long)]
    pub text: String,

    #[arg(long, default_value_t = 0)]
    pub useful_count: u32,

    /// Number of reviews the author has written
    #[arg(long, default_value_t = 0)]
    pub review_count: u32,

    #[arg(long, default_value_t = 0)]
    pub friend_count: u32,
}

/// Build a `ClientConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> ClientConfig {
    ClientConfig {
        base_url: args.base_url.trim().to_string(),
        timeout: Duration::from(args.timeout),
        user_agent: format!("reviewscope/{}", env!("CARGO_PKG_VERSION")),
    }
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args);
    let client = Arc::new(ApiClient::new(&cfg)?);
    debug!(base_url = %client.base_url(), timeout = ?cfg.timeout, "client ready");

    let (out_tx, out_handle) = spawn_output_writer();
    let res = dispatch(&args, &client, &out_tx).await;
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn dispatch(args: &Cli, client: &Arc<ApiClient>, out: &OutputTx) -> Result<()> {
    let json = args.json;
    match &args.command {
        Command::Watch { analysis_id, poll } => watch(client, analysis_id, poll, json, out).await,
        Command::Submit { file, watch: then_watch, poll } => {
            let processed = client.submit_file(file).await?;
            if json && !then_watch {
                emit_json(out, &processed)?;
            } else {
                let _ = out.send(OutputLine::Stderr(format!(
                    "Submitted {}: analysis {}",
                    file.display(),
                    processed.analysis_id
                )));
                if !then_watch {
                    let _ = out.send(OutputLine::Stdout(processed.analysis_id.clone()));
                }
            }
            if *then_watch {
                watch(client, &processed.analysis_id, poll, json, out).await?;
            }
            Ok(())
        }
        Command::List => {
            let records = client
                .list_analyses()
                .await
                .context("failed to fetch analysis history")?;
            if json {
                emit_json(out, &records)
            } else {
                emit_summary(out, text_summary::build_history_summary(&records));
                Ok(())
            }
        }
        Command::Show { analysis_id } => {
            let record = client
                .get_analysis(analysis_id)
                .await
                .with_context(|| format!("failed to fetch analysis {analysis_id}"))?;
            if json {
                emit_json(out, &record)
            } else {
                emit_summary(out, text_summary::build_record_summary(&record));
                Ok(())
            }
        }
        Command::Predict(p) => {
            let req = PredictRequest {
                review_content: p.text.trim().to_string(),
                useful_count: p.useful_count,
                review_count: p.review_count,
                friend_count: p.friend_count,
            };
            if req.review_content.is_empty() {
                anyhow::bail!("review content cannot be empty");
            }
            let result = client.predict(&req).await.context("prediction failed")?;
            if json {
                emit_json(out, &result)
            } else {
                emit_summary(out, text_summary::build_predict_summary(&result));
                Ok(())
            }
        }
        Command::Download {
            analysis_id,
            format,
            output,
        } => download(client, analysis_id, *format, output.as_deref(), json, out).await,
    }
}

async fn download(
    client: &ApiClient,
    analysis_id: &str,
    format: DownloadFormat,
    output: Option<&Path>,
    json: bool,
    out: &OutputTx,
) -> Result<()> {
    let record = client
        .get_analysis(analysis_id)
        .await
        .with_context(|| format!("failed to fetch analysis {analysis_id}"))?;
    if record.status != AnalysisStatus::Completed {
        anyhow::bail!(
            "analysis {} is {}; reports are only available once it has completed",
            record.id,
            record.status
        );
    }

    let path = orchestrator::resolve_download_path(&record.id, format, output);
    let bytes = client
        .download_results(&record.id, format, &path)
        .await
        .context("download failed")?;
    if json {
        emit_json(
            out,
            &crate::model::DownloadOutcome {
                analysis_id: record.id,
                format,
                path,
                bytes,
            },
        )
    } else {
        let _ = out.send(OutputLine::Stdout(format!(
            "Saved: {} ({} bytes)",
            path.display(),
            bytes
        )));
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {e}");
        futures::future::pending::<()>().await;
    }
}

/// Follow one analysis to the end, reporting progress on stderr.
async fn watch(
    client: &Arc<ApiClient>,
    analysis_id: &str,
    poll: &PollArgs,
    json: bool,
    out: &OutputTx,
) -> Result<()> {
    let poller = Poller::new(client.clone());
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<PollEvent>();
    let handle = tokio::spawn(orchestrator::run_watch(
        poller,
        analysis_id.to_string(),
        poll.watch_config(),
        evt_tx,
        shutdown_signal(),
    ));

    let mut settled = None;
    let mut last_line = String::new();
    while let Some(ev) = evt_rx.recv().await {
        match ev {
            PollEvent::Update(record) => {
                let line = text_summary::update_line(&record);
                if line != last_line {
                    let _ = out.send(OutputLine::Stderr(line.clone()));
                    last_line = line;
                }
            }
            PollEvent::Terminal(record) => settled = Some(record),
            PollEvent::Error(msg) => {
                let _ = out.send(OutputLine::Stderr(format!(
                    "Status check failed, retrying: {msg}"
                )));
            }
        }
    }

    let end = handle.await.context("watch task failed")??;
    let record = match (end, settled) {
        (WatchEnd::Interrupted, _) => {
            let _ = out.send(OutputLine::Stderr(format!("Stopped watching {analysis_id}")));
            return Ok(());
        }
        (WatchEnd::Settled, Some(record)) => record,
        (WatchEnd::Settled, None) => anyhow::bail!("watch of {analysis_id} ended without a final status"),
    };

    let processed =
        orchestrator::process_terminal(client, record, poll.download, poll.output.as_deref()).await;
    if json {
        emit_json(
            out,
            &serde_json::json!({
                "record": processed.record,
                "download": processed.download,
            }),
        )?;
    } else {
        emit_summary(out, text_summary::build_record_summary(&processed.record));
    }
    for msg in processed.messages {
        let _ = out.send(OutputLine::Stderr(msg));
    }

    if processed.record.status == AnalysisStatus::Failed {
        let reason = processed
            .record
            .error_message()
            .map(|m| format!(": {m}"))
            .unwrap_or_default();
        anyhow::bail!("analysis {} failed{}", processed.record.id, reason);
    }
    Ok(())
}

fn emit_json<T: Serialize>(out: &OutputTx, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("serialize output")?;
    let _ = out.send(OutputLine::Stdout(text));
    Ok(())
}

fn emit_summary(out: &OutputTx, summary: TextSummary) {
    for line in summary.lines {
        let _ = out.send(OutputLine::Stdout(line));
    }
}
