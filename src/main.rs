use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use chatreel::config::{load_and_validate_config, resolve_api_key, JobConfig, API_KEY_ENV};
use chatreel::pipeline::{run_job, CancelFlag, Collaborators, JobContext};
use chatreel::script::parse_script_with_diagnostics;
use chatreel::stage_error::{find_stage_error, Stage, StageError, StageResultExt};

const LOG_ENV: &str = "CHATREEL_LOG";

#[derive(Debug, Parser)]
#[command(name = "chatreel", version)]
#[command(about = "Render scripted text-message conversations into narrated video")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render a script to an MP4.
    Render {
        script: PathBuf,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        /// Parent directory for per-job scratch space and the default speech cache.
        #[arg(long = "work-dir")]
        work_dir: Option<PathBuf>,
        #[arg(long)]
        theme: Option<String>,
        #[arg(long = "api-key")]
        api_key: Option<String>,
        /// Also write the message timeline of the finished video here.
        #[arg(long = "timeline-json")]
        timeline_json: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Parse a script and summarise it without rendering.
    Check {
        script: PathBuf,
        /// Fail when any line was not recognized.
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        json: bool,
    },
}

impl Commands {
    fn json(&self) -> bool {
        match self {
            Commands::Render { json, .. } | Commands::Check { json, .. } => *json,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let json = cli.command.json();

    let result = match cli.command {
        Commands::Render {
            script,
            output,
            config,
            work_dir,
            theme,
            api_key,
            timeline_json,
            json,
        } => {
            let args = RenderArgs {
                script,
                output,
                config,
                work_dir,
                theme,
                api_key,
                timeline_json,
                json,
            };
            run_render(args).await
        }
        Commands::Check {
            script,
            strict,
            json,
        } => run_check(&script, strict, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report_error(&error, json);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_id() -> String {
    match option_env!("CHATREEL_GIT_HASH") {
        Some(hash) => format!("{} ({hash})", env!("CARGO_PKG_VERSION")),
        None => env!("CARGO_PKG_VERSION").to_owned(),
    }
}

fn report_error(error: &anyhow::Error, json: bool) {
    let stage_error = find_stage_error(error)
        .cloned()
        .unwrap_or_else(|| StageError::new(Stage::Input, format!("{error:#}")));
    if json {
        match serde_json::to_string_pretty(&stage_error.envelope()) {
            Ok(body) => println!("{body}"),
            Err(_) => eprintln!("error: {error:#}"),
        }
    } else {
        eprintln!("error: {stage_error}");
    }
}

struct RenderArgs {
    script: PathBuf,
    output: PathBuf,
    config: Option<PathBuf>,
    work_dir: Option<PathBuf>,
    theme: Option<String>,
    api_key: Option<String>,
    timeline_json: Option<PathBuf>,
    json: bool,
}

async fn run_render(args: RenderArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => load_and_validate_config(path).stage(Stage::Input)?,
        None => JobConfig::default(),
    };
    let theme = args.theme.unwrap_or_else(|| config.theme.clone());
    let api_key = resolve_api_key(args.api_key, std::env::var(API_KEY_ENV).ok());
    let work_root = args
        .work_dir
        .unwrap_or_else(|| std::env::temp_dir().join("chatreel"));
    let collaborators =
        Collaborators::defaults(&config, &theme, api_key).stage(Stage::Input)?;

    tracing::info!(build = %build_id(), theme = %theme, fps = config.fps, "render requested");
    let ctx = JobContext {
        script_path: args.script,
        work_root,
        output_path: args.output,
        theme,
        sounds: config.sounds.clone(),
        config,
        cancel: CancelFlag::new(),
    };
    let output = run_job(ctx, collaborators).await?;

    if let Some(path) = &args.timeline_json {
        write_json(path, &output.message_timeline).stage(Stage::Output)?;
    }

    if args.json {
        let body = json!({ "ok": true, "build": build_id(), "result": output });
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!(
            "Wrote {} ({:.2}s, {} scenes, {} frames)",
            output.video_path.display(),
            output.duration_seconds,
            output.scenes,
            output.frames
        );
    }
    Ok(())
}

fn run_check(script_path: &Path, strict: bool, json: bool) -> Result<()> {
    let raw = fs::read_to_string(script_path)
        .with_context(|| format!("failed to read script {}", script_path.display()))
        .stage(Stage::Input)?;
    let (script, unrecognized) = parse_script_with_diagnostics(&raw);
    if script.threads.is_empty() {
        return Err(StageError::new(Stage::Input, "script contains no threads").into());
    }
    if strict {
        if let Some(first) = unrecognized.first() {
            return Err(StageError::new(
                Stage::Input,
                format!(
                    "{} unrecognized line(s); first at line {}: {}",
                    unrecognized.len(),
                    first.line_number,
                    first.text
                ),
            )
            .into());
        }
    }

    let stats = script.stats();
    if json {
        let body = json!({
            "ok": true,
            "stats": stats,
            "directives": script.directives,
            "unrecognized": unrecognized,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!(
        "OK: {} ({} threads, {} messages, {} spoken lines, {:.2}s of breaks)",
        script_path.display(),
        stats.threads,
        stats.messages,
        stats.spoken_lines,
        stats.break_seconds
    );
    println!(
        "Texts: {}  Images: {}  Cards: {}  Breaks: {}",
        stats.texts, stats.images, stats.cards, stats.breaks
    );
    for line in &unrecognized {
        println!("skipped line {}: {}", line.line_number, line.text);
    }
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
