// `aidevs` entry point.
//
// Startup sequence:
// 1. Parse arguments
// 2. Initialize tracing (stderr, or a log file with --log-file)
// 3. Load config (defaults/, config/, .env, environment)
// 4. Build the task context
// 5. Run the task or server; print the outcome as JSON

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use aidevs_core::config;
use aidevs_tasks::server::{self, drone, heart};
use aidevs_tasks::tasks;
use aidevs_tasks::{TaskContext, TaskOutcome};

#[derive(Parser, Debug)]
#[command(name = "aidevs", version, about = "Solve AI_devs puzzle tasks")]
struct Cli {
    /// Write logs to logs/aidevs.log instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit the poligon warm-up data
    Poligon,
    /// Log into the robot panel by answering its question
    Login,
    /// Pass the robot identity check
    Verify,
    /// Fix the calibration file and submit it
    Json,
    /// Redact personal data from the agent record
    Censor,
    /// Find the street from interrogation recordings
    Mp3 {
        #[arg(long, default_value = "data/przesluchania")]
        dir: PathBuf,
    },
    /// Identify the city from map fragments
    Map {
        #[arg(long, default_value = "data/mapa")]
        dir: PathBuf,
    },
    /// Generate the robot image from its description
    Robotid,
    /// Sort factory reports into people and hardware
    Categories {
        #[arg(long, default_value = "data/pliki_z_fabryki")]
        dir: PathBuf,
    },
    /// Find inactive datacenters managed by inactive users
    Database,
    /// Track the target through the people and places APIs
    Loop,
    /// Shortest chain of acquaintances between two people
    Connections,
    /// Repair the photos and describe the person on them
    Photos,
    /// Classify lab results with the fine-tuned model
    Research {
        #[arg(long, default_value = "data/lab_data")]
        dir: PathBuf,
    },
    /// Write the fine-tuning set from correct.txt and incorrect.txt
    PrepareTraining {
        #[arg(long, default_value = "data/lab_data")]
        dir: PathBuf,
        #[arg(long, default_value = "training_data.jsonl")]
        output: PathBuf,
    },
    /// Answer questions by crawling the company website
    Softo,
    /// Answer questions about the notebook
    Notes {
        /// Text of the handwritten page 19
        #[arg(long)]
        page19: Option<PathBuf>,
    },
    /// Answer questions from phone conversation transcripts
    Phone {
        /// Directory of fact files
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Locate people seen in the asked-about city
    Gps,
    /// Solve the time-locked challenge
    Timelock,
    /// Run the drone navigation webhook
    DroneServer {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the robot heart verification webhook
    HeartServer {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Register a public webhook URL with the grading server
    RegisterWebhook {
        url: String,
        /// `webhook` for the drone server, `serce` for the heart server
        #[arg(long, default_value = drone::TASK)]
        task: String,
        /// Store the URL without running the grader's tests
        #[arg(long)]
        just_update: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.log_file) {
        eprintln!("failed to initialize logging: {e:#}");
        return ExitCode::FAILURE;
    }
    match run(cli.command).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run one command; `Ok(false)` means it ran but did not succeed.
async fn run(command: Command) -> anyhow::Result<bool> {
    if let Command::PrepareTraining { dir, output } = &command {
        let count = tasks::research::prepare_training(dir, output)?;
        println!("{count} examples written to {}", output.display());
        return Ok(true);
    }

    let config = config::load_config().context("failed to load configuration")?;
    info!(report_url = %config.centrala.report_url, "config loaded");
    let ctx = TaskContext::from_config(config).context("failed to build task context")?;

    let outcome = match command {
        Command::Poligon => tasks::poligon::run(&ctx).await?,
        Command::Login => tasks::login::run(&ctx).await?,
        Command::Verify => tasks::verify::run(&ctx).await?,
        Command::Json => tasks::json_fix::run(&ctx).await?,
        Command::Censor => tasks::censor::run(&ctx).await?,
        Command::Mp3 { dir } => tasks::mp3::run(&ctx, &dir).await?,
        Command::Map { dir } => tasks::map::run(&ctx, &dir).await?,
        Command::Robotid => tasks::robotid::run(&ctx).await?,
        Command::Categories { dir } => tasks::categories::run(&ctx, &dir).await?,
        Command::Database => tasks::database::run(&ctx).await?,
        Command::Loop => tasks::loop_search::run(&ctx).await?,
        Command::Connections => tasks::connections::run(&ctx).await?,
        Command::Photos => tasks::photos::run(&ctx).await?,
        Command::Research { dir } => tasks::research::run(&ctx, &dir).await?,
        Command::Softo => tasks::softo::run(&ctx).await?,
        Command::Notes { page19 } => tasks::notes::run(&ctx, page19.as_deref()).await?,
        Command::Phone { dir } => tasks::phone::run(&ctx, dir.as_deref()).await?,
        Command::Gps => tasks::gps::run(&ctx).await?,
        Command::Timelock => tasks::timelock::run(&ctx).await?,
        Command::DroneServer { port } => {
            let (host, port) = (ctx.config.webhook.host.clone(), port.unwrap_or(ctx.config.webhook.port));
            server::serve(drone::router(Arc::new(ctx)), &host, port).await?;
            return Ok(true);
        }
        Command::HeartServer { port } => {
            let (host, port) = (ctx.config.webhook.host.clone(), port.unwrap_or(ctx.config.webhook.port));
            let app = heart::HeartApp::new(Arc::new(ctx));
            server::serve(heart::router(app), &host, port).await?;
            return Ok(true);
        }
        Command::RegisterWebhook { url, task, just_update } => {
            let suffix = (task == drone::TASK).then_some("/drone");
            server::validate_webhook_url(&url, suffix)?;
            let outcome = server::register_webhook(&ctx.centrala, &task, Some(&url), just_update).await?;
            println!("{}", serde_json::to_string_pretty(&server::registration_reply(&outcome))?);
            return Ok(outcome.accepted() || outcome.flag.is_some());
        }
        Command::PrepareTraining { .. } => anyhow::bail!("prepare-training runs without a task context"),
    };
    report(&outcome)
}

fn report(outcome: &TaskOutcome) -> anyhow::Result<bool> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    match &outcome.flag {
        Some(flag) => info!(task = %outcome.task, %flag, "flag found"),
        None => info!(task = %outcome.task, success = outcome.success, "no flag"),
    }
    Ok(outcome.success)
}

/// Log to stderr, or to `logs/aidevs.log` when `to_file` is set.
fn init_tracing(to_file: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("aidevs=info,aidevs_core=info,aidevs_llm=info,aidevs_tasks=info,warn"));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true);

    if to_file {
        let log_dir = std::env::current_dir()?.join("logs");
        std::fs::create_dir_all(&log_dir)?;
        let log_file = std::fs::File::create(log_dir.join("aidevs.log"))?;
        let subscriber = builder
            .with_writer(std::sync::Mutex::new(log_file))
            .with_ansi(false)
            .with_thread_ids(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;
    } else {
        let subscriber = builder.with_writer(std::io::stderr).finish();
        tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;
    }
    Ok(())
}
