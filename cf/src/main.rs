//! cf - CLI entry point
//!
//! `play` runs a scheduler in the foreground; every other subcommand
//! resolves the workflow's contact file and speaks the command protocol.
//! Exit status: 0 success, 1 user error, 2 server error.

use std::path::PathBuf;
use std::sync::Mutex;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cycleflow::cli::{Cli, Command};
use cycleflow::{Client, ClientError, RunDir, ShutdownReason, StopMode};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = run(cli).await;
    std::process::exit(code);
}

fn setup_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> i32 {
    // The scheduler logs to the run directory; client commands to stderr
    let log_file = match &cli.command {
        Command::Play { workflow, .. } => Some(RunDir::for_workflow(workflow).scheduler_log()),
        _ => None,
    };
    if let Err(e) = setup_logging(cli.verbose, log_file) {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        return 2;
    }

    match dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            e.exit_code()
        }
    }
}

async fn dispatch(command: Command) -> Result<i32, ClientError> {
    match command {
        Command::Play { workflow, source } => play(&workflow, source).await,
        Command::Stop {
            workflow,
            now,
            at_clock_time,
            at_cycle_point,
        } => {
            let mode = if let Some(time) = at_clock_time {
                StopMode::AtClockTime(time)
            } else if let Some(point) = at_cycle_point {
                StopMode::AtCyclePoint(point)
            } else {
                match now {
                    0 => StopMode::Clean,
                    1 => StopMode::Now,
                    _ => StopMode::NowNow,
                }
            };
            let mode = serde_json::to_value(mode).map_err(|e| ClientError::Server(e.to_string()))?;
            request(&workflow, "stop", json!({ "mode": mode })).await
        }
        Command::Reload { workflow } => request(&workflow, "reload", Value::Null).await,
        Command::Hold { workflow, ids } => request(&workflow, "hold", json!({ "ids": ids })).await,
        Command::Release { workflow, ids } => request(&workflow, "release", json!({ "ids": ids })).await,
        Command::Trigger { workflow, ids } => request(&workflow, "trigger", json!({ "ids": ids })).await,
        Command::Set { workflow, id, outputs } => {
            request(&workflow, "set", json!({ "id": id, "outputs": outputs })).await
        }
        Command::Remove { workflow, ids } => request(&workflow, "remove", json!({ "ids": ids })).await,
        Command::Kill { workflow, ids } => request(&workflow, "kill", json!({ "ids": ids })).await,
        Command::Poll { workflow, ids } => request(&workflow, "poll", json!({ "ids": ids })).await,
        Command::Broadcast {
            workflow,
            set,
            cancel,
            clear,
            expire,
            points,
            namespaces,
        } => {
            let args = broadcast_args(set, cancel, clear, expire, points, namespaces)?;
            request(&workflow, "broadcast", args).await
        }
        Command::ExtTrigger { workflow, event, point } => {
            request(&workflow, "ext-trigger", json!({ "event": event, "point": point })).await
        }
        Command::Show { workflow, id } => request(&workflow, "show", json!({ "id": id })).await,
        Command::Dump { workflow } => request(&workflow, "dump", Value::Null).await,
        Command::CatLog { workflow, job, file } => cat_log(&workflow, job.as_deref(), &file),
    }
}

async fn play(workflow: &str, source: Option<PathBuf>) -> Result<i32, ClientError> {
    match cycleflow::play(workflow, source).await {
        Ok(reason) => {
            info!(?reason, "Scheduler finished");
            match reason {
                ShutdownReason::Complete | ShutdownReason::Stopped => Ok(0),
                ShutdownReason::Aborted(msg) => Err(ClientError::Server(format!("workflow aborted: {}", msg))),
                ShutdownReason::Fatal(msg) => Err(ClientError::Server(msg)),
            }
        }
        Err(e) => Err(ClientError::Server(format!("{:#}", e))),
    }
}

async fn request(workflow: &str, command: &str, args: Value) -> Result<i32, ClientError> {
    let rundir = RunDir::for_workflow(workflow);
    let client = Client::from_contact_file(&rundir.contact_file())?;
    let data = client.request(command, args).await?;
    print_data(command, &data);
    Ok(0)
}

fn broadcast_args(
    set: Vec<String>,
    cancel: Vec<String>,
    clear: bool,
    expire: Option<String>,
    points: Vec<String>,
    namespaces: Vec<String>,
) -> Result<Value, ClientError> {
    let (op, settings, keys, cutoff) = if clear {
        ("clear", Default::default(), Vec::new(), None)
    } else if let Some(cutoff) = expire {
        ("expire", Default::default(), Vec::new(), Some(cutoff))
    } else if !cancel.is_empty() {
        ("cancel", Default::default(), cancel, None)
    } else if !set.is_empty() {
        let mut settings = std::collections::BTreeMap::new();
        for pair in set {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(ClientError::User(format!("bad setting {:?}, expected KEY=VALUE", pair)));
            };
            settings.insert(key.to_string(), value.to_string());
        }
        ("set", settings, Vec::new(), None)
    } else {
        return Err(ClientError::User(
            "broadcast requires one of --set, --cancel, --clear, --expire".to_string(),
        ));
    };
    Ok(json!({
        "op": op,
        "points": points,
        "namespaces": namespaces,
        "settings": settings,
        "keys": keys,
        "cutoff": cutoff,
    }))
}

fn print_data(command: &str, data: &Value) {
    match command {
        "dump" => print_dump(data),
        "show" => print_show(data),
        _ => {
            if !data.is_null() {
                println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
            }
        }
    }
}

fn paint_state(state: &str) -> colored::ColoredString {
    match state {
        "succeeded" => state.green(),
        "failed" | "submit-failed" => state.red(),
        "running" => state.cyan(),
        "submitted" | "preparing" => state.yellow(),
        "expired" => state.magenta(),
        other => other.normal(),
    }
}

fn print_dump(data: &Value) {
    if let Some(tasks) = data.get("tasks").and_then(Value::as_array) {
        for task in tasks {
            let id = task.get("id").and_then(Value::as_str).unwrap_or("?");
            let state = task.get("state").and_then(Value::as_str).unwrap_or("?");
            let held = task.get("is_held").and_then(Value::as_bool).unwrap_or(false);
            let marker = if held { " (held)".dimmed() } else { "".normal() };
            println!("{} {}{}", id.bold(), paint_state(state), marker);
        }
    }
    if let Some(broadcasts) = data.get("broadcasts").and_then(Value::as_array) {
        for b in broadcasts {
            println!(
                "{} [{}][{}] {} = {}",
                "broadcast".dimmed(),
                b.get("point").and_then(Value::as_str).unwrap_or("*"),
                b.get("namespace").and_then(Value::as_str).unwrap_or("root"),
                b.get("key").and_then(Value::as_str).unwrap_or("?"),
                b.get("value").and_then(Value::as_str).unwrap_or("?"),
            );
        }
    }
}

fn print_show(data: &Value) {
    let id = data.get("id").and_then(Value::as_str).unwrap_or("?");
    let state = data.get("state").and_then(Value::as_str).unwrap_or("?");
    println!("{}: {}", id.bold(), paint_state(state));
    if let Some(outputs) = data.get("outputs").and_then(Value::as_array) {
        let labels: Vec<&str> = outputs.iter().filter_map(Value::as_str).collect();
        println!("  outputs: {}", labels.join(", "));
    }
    if let Some(prereqs) = data.get("prerequisites").and_then(Value::as_array) {
        for p in prereqs {
            let cond = p.get("condition").and_then(Value::as_str).unwrap_or("?");
            let ok = p.get("satisfied").and_then(Value::as_bool).unwrap_or(false);
            let mark = if ok { "+".green() } else { "-".red() };
            println!("  {} {}", mark, cond);
        }
    }
    if let Some(xts) = data.get("xtriggers").and_then(Value::as_array) {
        for xt in xts.iter().filter_map(Value::as_str) {
            println!("  {} {}", "@".yellow(), xt);
        }
    }
}

fn cat_log(workflow: &str, job: Option<&str>, file: &str) -> Result<i32, ClientError> {
    let rundir = RunDir::for_workflow(workflow);
    let path = match job {
        None => rundir.scheduler_log(),
        Some(selector) => {
            let parts: Vec<&str> = selector.split('/').collect();
            let [point, name, submit] = parts.as_slice() else {
                return Err(ClientError::User(format!(
                    "bad job selector {:?}, expected POINT/NAME/NN",
                    selector
                )));
            };
            let submit_num: u32 = submit
                .parse()
                .map_err(|_| ClientError::User(format!("bad submit number {:?}", submit)))?;
            rundir.job_dir(point, name, submit_num).join(file)
        }
    };
    let content = std::fs::read_to_string(&path)
        .map_err(|e| ClientError::User(format!("cannot read {}: {}", path.display(), e)))?;
    print!("{}", content);
    Ok(0)
}
