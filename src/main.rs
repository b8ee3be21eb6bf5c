//! runchart - declarative state chart interpreter
//!
//! Validates charts, drives persisted machines and inspects dumps.

use clap::{Parser, Subcommand};
use colored::Colorize;
use runchart_core::{codec, Runner, StateChart};
use runchart_pool::{Config, MachineKey, RunnerPool};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runchart")]
#[command(about = "Declarative state chart interpreter")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, global = true, env = "RUNCHART_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a chart and print its summary
    Validate {
        /// Chart description (.json, .yaml, .yml or .xml)
        chart: PathBuf,
    },

    /// Start or resume a machine and send events to it
    Send {
        /// Chart description (.json, .yaml, .yml or .xml)
        chart: PathBuf,

        /// Owner of the machine
        #[arg(short, long)]
        owner: String,

        /// Event to send, repeatable
        #[arg(short, long = "event")]
        events: Vec<String>,

        /// JSON payload passed to every transition
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Decode a machine dump (binary or JSON)
    Inspect {
        /// Dump file
        dump: PathBuf,
    },

    /// List machines in the configured store
    Machines,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(c) => {
            if let Some(path) = &cli.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    match cli.command {
        Commands::Validate { chart } => validate(&chart),
        Commands::Send {
            chart,
            owner,
            events,
            payload,
        } => send(&config, &chart, &owner, &events, payload.as_deref()),
        Commands::Inspect { dump } => inspect(&dump),
        Commands::Machines => machines(&config),
    }
}

fn load_chart(path: &Path) -> Result<StateChart, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let chart = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => StateChart::from_yaml(&content)?,
        Some("xml") => StateChart::from_xml(&content)?,
        _ => StateChart::from_json(&content)?,
    };
    Ok(chart)
}

fn validate(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let chart = match load_chart(path) {
        Ok(chart) => chart,
        Err(e) => {
            println!("{} {}: {}", "✗".red(), path.display(), e);
            return Err(e);
        }
    };

    println!("{} {}", "✓".green(), path.display());
    println!("  name:    {}", chart.name());
    println!("  id:      {}", chart.id());
    println!("  initial: {}", chart.initial_state().name.bold());
    let finals: Vec<&str> = chart
        .final_states()
        .iter()
        .map(|s| s.name.as_str())
        .collect();
    println!("  final:   {}", finals.join(", "));
    println!("  events:  {}", chart.events().join(", "));
    println!("  states:  {}", chart.states().len());
    Ok(())
}

fn send(
    config: &Config,
    chart_path: &Path,
    owner: &str,
    events: &[String],
    payload: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let chart = load_chart(chart_path)?;
    let key = MachineKey::new(owner, chart.name());
    let payload: Value = match payload {
        Some(p) => serde_json::from_str(p)?,
        None => Value::Null,
    };

    let store = config.storage.open()?;
    let pool = RunnerPool::new(config.pool.clone(), store, || {
        Runner::new().with_options(config.runner.clone())
    });
    pool.register_chart(chart);

    let mut runner = pool.acquire_current_or_load(&key)?;
    if runner.start(payload.clone())? {
        println!("{} started {}", "→".cyan(), key);
    }

    for event in events {
        match runner.send(event, payload.clone()) {
            Ok(_) => println!(
                "{} {} -> {}",
                "✓".green(),
                event,
                runner.current_state()?.name.bold()
            ),
            Err(e) => {
                println!("{} {}: {}", "✗".red(), event, e);
                return Err(e.into());
            }
        }
    }

    print_position(&runner)?;
    Ok(())
}

fn print_position(runner: &Runner) -> Result<(), Box<dyn std::error::Error>> {
    let state = runner.current_state()?;
    let status = if runner.is_finished()? {
        "finished".yellow()
    } else {
        "running".green()
    };
    println!("state: {} ({})", state.name.bold(), status);
    for (event, target) in runner.possible_transitions()? {
        println!("  {} -> {}", event.cyan(), target);
    }
    println!("history: {}", runner.describe_history()?);
    Ok(())
}

fn inspect(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;
    let format = codec::Format::detect(&data);
    let chart = codec::decode(&data)?;

    println!("{} {} ({:?})", "✓".green(), path.display(), format);
    println!("  name:    {}", chart.name());
    println!("  id:      {}", chart.id());
    println!("  owner:   {}", chart.owner().unwrap_or("-"));
    match chart.current_state() {
        Some(state) => println!("  state:   {}", state.name.bold()),
        None => println!("  state:   {}", "not started".dimmed()),
    }
    for record in chart.history() {
        println!(
            "  {} {:>8} {} -> {} ({:?})",
            record.timestamp,
            record.event.as_deref().unwrap_or("-"),
            record.src.as_deref().unwrap_or("-"),
            record.state,
            record.status
        );
    }
    Ok(())
}

fn machines(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = config.storage.open()?;
    let keys = store.keys()?;
    if keys.is_empty() {
        println!("{}", "no machines".dimmed());
        return Ok(());
    }
    for key in keys {
        println!("{}  {}", key.owner.bold(), key.chart_type);
    }
    Ok(())
}
