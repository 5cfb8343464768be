use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use console::Style;

use gatework::cli::{Cli, Command};
use gatework::completion::StatusSummary;
use gatework::config::GateworkConfig;
use gatework::executors::PipelineExecutor;
use gatework::logging;
use gatework::orchestrator::{EngineConfig, WorkflowEngine};
use gatework::state_machine::{Backlog, WorkItem};
use gatework::store::SessionStore;
use gatework::ui::{self, SessionProgress};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(err) = run(cli).await {
        eprintln!("{} {err:#}", Style::new().red().bold().apply_to("error:"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => GateworkConfig::load_from(path)?,
        None => GateworkConfig::load()?,
    };
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    let store = SessionStore::new(&config.state_dir);

    match cli.command {
        Command::Init {
            project_id,
            backlog,
            meta_item,
        } => cmd_init(&store, &project_id, &backlog, &meta_item),
        Command::Run => cmd_run(&config, store).await,
        Command::Status { json } => cmd_status(&store, json),
    }
}

fn cmd_init(store: &SessionStore, project_id: &str, backlog_path: &Path, meta_item: &str) -> Result<()> {
    let contents = std::fs::read_to_string(backlog_path)
        .with_context(|| format!("failed to read {}", backlog_path.display()))?;
    let mut items: Vec<WorkItem> = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", backlog_path.display()))?;
    if !items.iter().any(|i| i.id == meta_item) {
        items.insert(0, WorkItem::new(meta_item, "Session log", 0));
    }

    let mut backlog = Backlog::new(meta_item, items)?;
    let project = store.initialize(project_id, &mut backlog)?;
    println!(
        "Initialized {} with {} items in {}",
        project.project_id,
        project.total_items,
        store.root().display()
    );
    Ok(())
}

async fn cmd_run(config: &GateworkConfig, store: SessionStore) -> Result<()> {
    let workdir = std::env::current_dir().context("failed to resolve working directory")?;
    let executor = PipelineExecutor::from_config(config, &workdir)?;
    let mut engine = WorkflowEngine::open(executor, store, EngineConfig::from(config))?
        .with_progress(SessionProgress::start());

    let result = engine.run_session().await;
    drop(engine);
    let report = result.context("session aborted")?;

    ui::print_report(&report);
    if let Some(signal) = report.completion_signal() {
        println!("{signal}");
    }
    Ok(())
}

fn cmd_status(store: &SessionStore, json: bool) -> Result<()> {
    let project = store.load_project()?;
    let backlog = store.load_backlog(&project)?;
    let run = store.load_run_state()?;
    let summary = StatusSummary::collect(&project, &backlog, &run)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        ui::print_status(&summary);
    }
    Ok(())
}
