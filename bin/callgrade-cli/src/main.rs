mod report;

use anyhow::{Context, Result};
use callgrade_crm::{locate_calls, HubSpotClient};
use callgrade_evaluate::{EvaluatorConfig, Rubric, ScoreStrategy};
use callgrade_pipeline::{
    run, BackendOptions, Backends, Credentials, Endpoints, Limits, PipelineConfig, Progress, ProgressEvent,
    RunOutcome,
};
use callgrade_types::DateRange;
use callgrade_utils::init_tracing;
use chrono::{Duration, Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "callgrade", about = "Grade recorded HubSpot sales calls", version)]
struct Cli {
    #[command(flatten)]
    conn: Connection,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct Connection {
    /// HubSpot private app token
    #[arg(long, env = "HUBSPOT_ACCESS_TOKEN", hide_env_values = true, global = true)]
    hubspot_token: Option<String>,

    /// Google API key for Gemini (and speech, unless overridden)
    #[arg(long, env = "GOOGLE_API_KEY", hide_env_values = true, global = true)]
    google_api_key: Option<String>,

    /// Separate key for the Speech-to-Text API
    #[arg(long, env = "GOOGLE_SPEECH_API_KEY", hide_env_values = true, global = true)]
    speech_api_key: Option<String>,

    #[arg(long, default_value = callgrade_crm::DEFAULT_BASE_URL, global = true)]
    hubspot_base_url: String,

    #[arg(long, default_value = callgrade_transcribe::DEFAULT_BASE_URL, global = true)]
    speech_base_url: String,

    #[arg(long, default_value = callgrade_evaluate::gemini::DEFAULT_BASE_URL, global = true)]
    gemini_base_url: String,

    /// Gemini model name
    #[arg(long, default_value = callgrade_evaluate::gemini::DEFAULT_MODEL, global = true)]
    model: String,
}

#[derive(Args, Debug)]
struct Window {
    /// First day (YYYY-MM-DD), defaults to a week ago
    #[arg(long)]
    from: Option<NaiveDate>,

    /// Last day (YYYY-MM-DD), defaults to today
    #[arg(long)]
    to: Option<NaiveDate>,
}

impl Window {
    fn resolve(&self) -> (NaiveDate, NaiveDate) {
        let today = Local::now().date_naive();
        let end = self.to.unwrap_or(today);
        let start = self.from.unwrap_or(today - Duration::days(7));
        (start, end)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RubricArg {
    Full,
    Brief,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScoreArg {
    LineScan,
    Checkmarks,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List calls with recordings in the window
    List {
        #[command(flatten)]
        window: Window,
    },
    /// Transcribe and grade selected calls
    Analyze {
        #[command(flatten)]
        window: Window,

        /// Call id to analyse; repeatable. Defaults to the first calls found.
        #[arg(long = "call", value_name = "ID")]
        calls: Vec<String>,

        #[arg(long, default_value_t = 3)]
        max_selections: usize,

        #[arg(long, value_enum, default_value_t = RubricArg::Full)]
        rubric: RubricArg,

        /// Score heuristic; defaults to the rubric's own
        #[arg(long, value_enum)]
        score: Option<ScoreArg>,

        /// Ignore the PUNTAJE_FINAL line and use the heuristic only
        #[arg(long)]
        no_structured_score: bool,

        /// Calls processed concurrently
        #[arg(long, default_value_t = 1)]
        jobs: usize,

        /// Write results as CSV
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Write the run summary as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },
}

struct ConsoleProgress;

impl Progress for ConsoleProgress {
    fn event(&self, ev: ProgressEvent) {
        match ev {
            ProgressEvent::Started { index, total, call_id } => {
                eprintln!("[{}/{}] call {call_id}", index + 1, total)
            }
            ProgressEvent::Stage { call_id, stage } => eprintln!("      {call_id}: {stage}"),
            ProgressEvent::Finished { call_id, ok } => {
                eprintln!("      {call_id}: {}", if ok { "done" } else { "skipped" })
            }
        }
    }
}

fn required(value: &Option<String>, what: &str, env: &str) -> Result<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .with_context(|| format!("{what} missing; set {env} or pass the flag"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let conn = &cli.conn;

    match &cli.command {
        Command::List { window } => {
            let token = required(&conn.hubspot_token, "HubSpot token", "HUBSPOT_ACCESS_TOKEN")?;
            let (start, end) = window.resolve();
            let range = DateRange::from_dates(start, end)?;
            let crm = HubSpotClient::new(&conn.hubspot_base_url, &token)?;
            let calls = locate_calls(&crm, &range).await?;
            if calls.is_empty() {
                println!("No calls found between {start} and {end}.");
            } else {
                report::print_calls(&calls);
            }
        }
        Command::Analyze {
            window,
            calls,
            max_selections,
            rubric,
            score,
            no_structured_score,
            jobs,
            csv,
            json,
        } => {
            let creds = Credentials {
                hubspot_token: required(&conn.hubspot_token, "HubSpot token", "HUBSPOT_ACCESS_TOKEN")?,
                google_api_key: required(&conn.google_api_key, "Google API key", "GOOGLE_API_KEY")?,
                speech_api_key: conn.speech_api_key.clone().filter(|k| !k.trim().is_empty()),
            };
            let opts = BackendOptions {
                endpoints: Endpoints {
                    hubspot: conn.hubspot_base_url.clone(),
                    speech: conn.speech_base_url.clone(),
                    gemini: conn.gemini_base_url.clone(),
                },
                gemini_model: conn.model.clone(),
                ..BackendOptions::default()
            };
            let backends = Backends::from_credentials(&creds, &opts)?;

            let rubric = match rubric {
                RubricArg::Full => Rubric::Full,
                RubricArg::Brief => Rubric::Brief,
            };
            let mut evaluator = EvaluatorConfig::for_rubric(rubric);
            if let Some(s) = score {
                evaluator.strategy = match s {
                    ScoreArg::LineScan => ScoreStrategy::LineScan,
                    ScoreArg::Checkmarks => ScoreStrategy::Checkmarks,
                };
            }
            evaluator.structured_score = !no_structured_score;
            let cfg = PipelineConfig {
                evaluator,
                limits: Limits {
                    jobs: (*jobs).max(1),
                    ..Limits::default()
                },
                max_selections: Some(*max_selections),
            };

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling remaining calls");
                    on_signal.cancel();
                }
            });

            let (start, end) = window.resolve();
            tracing::info!(%start, %end, jobs = cfg.limits.jobs, "starting analysis");
            let outcome = run(&backends, &cfg, start, end, calls, cancel, &ConsoleProgress).await?;

            match outcome {
                RunOutcome::NoCalls => println!("No calls found between {start} and {end}."),
                RunOutcome::Analyzed { summary, .. } => {
                    report::print_summary(&summary);
                    if let Some(path) = csv {
                        report::write_csv(path, &summary.results)?;
                        tracing::info!(path = %path.display(), "csv written");
                    }
                    if let Some(path) = json {
                        report::write_json(path, &summary)?;
                        tracing::info!(path = %path.display(), "json written");
                    }
                }
            }
        }
    }

    Ok(())
}
