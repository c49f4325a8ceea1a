use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::EnvFilter;

use webpilot::config::PilotConfig;
use webpilot::dom::DomReducer;
use webpilot::oracle::gemini::GeminiClient;
use webpilot::oracle::usage::UsageTracker;
use webpilot::orchestrator::{Orchestrator, StepState};
use webpilot::planner;
use webpilot::session::{cdp, ActiveSession};
use webpilot::tools::{StdioHuman, StdioSink};
use webpilot::PilotError;

#[derive(Parser, Debug)]
#[command(name = "webpilot", version, about = "Automate web tasks with a model-driven browser")]
struct Cli {
    /// Task to carry out, e.g. "find the cheapest flight to Lisbon in May".
    query: Option<String>,

    /// Path to a JSON config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the browser without a visible window.
    #[arg(long)]
    headless: bool,

    /// Directory for persisted result files.
    #[arg(long)]
    results_dir: Option<PathBuf>,
}

fn init_tracing() -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "webpilot.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

fn read_query_interactively() -> anyhow::Result<String> {
    print!("What should I do? > ");
    std::io::stdout().flush()?;
    let mut query = String::new();
    std::io::stdin().read_line(&mut query)?;
    Ok(query.trim().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let mut config = PilotConfig::load(cli.config.as_deref())?;
    if cli.headless {
        config.headless = true;
    }
    if let Some(dir) = cli.results_dir {
        config.results_dir = dir;
    }

    let api_key = std::env::var("GEMINI_API_KEY")
        .context("GEMINI_API_KEY must be set (https://aistudio.google.com/apikey)")?;

    let query = match cli.query {
        Some(query) => query,
        None => read_query_interactively()?,
    };

    let usage = Arc::new(UsageTracker::new());
    let oracle = GeminiClient::new(config.clone(), api_key, usage);
    let reducer = DomReducer::new().with_custom_tags(config.custom_interactive_tags.clone());
    let sink = StdioSink::new(config.results_dir.clone());
    let human = StdioHuman;

    let steps = planner::plan_steps(&oracle, &query).await?;
    println!("Plan:");
    for step in &steps {
        println!("  {}. {}", step.id, step.goal);
    }

    let (browser, pump) = cdp::launch(config.headless)
        .await
        .map_err(|err| PilotError::session(err.to_string()))?;
    let browser: Arc<dyn webpilot::session::BrowserDriver> = Arc::new(browser);
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|err| PilotError::session(err.to_string()))?;
    let mut session = ActiveSession::new(browser, page);

    let orchestrator = Orchestrator::new(&oracle, &oracle, &reducer, &sink, &human, &config);
    let result = orchestrator.run(&mut session, &steps).await;

    drop(session);
    pump.abort();

    let report = match result {
        Ok(report) => report,
        Err(PilotError::UserAbort) => {
            println!("Run aborted by user.");
            std::process::exit(2);
        }
        Err(err) => {
            error!(error = %err, "run failed");
            return Err(err.into());
        }
    };

    println!("\nRun {}:", if report.success { "succeeded" } else { "FAILED" });
    for step in &report.steps {
        let state = match step.state {
            StepState::Pending => "pending",
            StepState::Executing => "interrupted",
            StepState::Succeeded => "ok",
            StepState::Failed => "failed",
        };
        print!("  {}. [{state}] {}", step.id, step.goal);
        if step.final_goal != step.goal {
            print!(" (revised: {})", step.final_goal);
        }
        if let Some(message) = &step.message {
            print!(" -- {message}");
        }
        println!();
    }
    info!(success = report.success, "run finished");

    if !report.success {
        std::process::exit(1);
    }
    Ok(())
}
