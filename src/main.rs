mod cli;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trainyard::config::Config;
use trainyard::engine::{Engine, http_client};
use trainyard::manifest::Manifest;
use trainyard::state_machine::JobView;
use trainyard::store::MemoryJobStore;
use trainyard::trainer::TrainerRegistry;
use trainyard::ui::FollowProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let registry = TrainerRegistry::builtin(&config.backends, http_client()?);

    match cli.command {
        Command::Platforms => {
            for platform in registry.platforms() {
                let entry = registry.resolve(platform)?;
                println!("{platform:<12} {}", entry.required_keys.join(", "));
            }
            Ok(())
        }
        Command::Check { file } => check(&file, &registry).await,
        Command::Run { file, timeout_secs } => {
            run(&config, registry, &file, Duration::from_secs(timeout_secs)).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "trainyard=debug" } else { "trainyard=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            Config::load_from(path)
        }
        None => Config::load(),
    };
    config.context("failed to load configuration")
}

async fn check(file: &Path, registry: &TrainerRegistry) -> Result<()> {
    let manifest = Manifest::load(file)?;
    let issues = manifest.check(registry).await;
    if issues.is_empty() {
        println!("{}: {} job(s) ok", file.display(), manifest.jobs.len());
        return Ok(());
    }
    for issue in &issues {
        println!("{issue}");
    }
    bail!("{} problem(s) found in {}", issues.len(), file.display())
}

async fn run(config: &Config, registry: TrainerRegistry, file: &Path, limit: Duration) -> Result<()> {
    let manifest = Manifest::load(file)?;
    let credentials = Arc::new(manifest.credential_store().await);
    let engine = Engine::start(config, Arc::new(MemoryJobStore::new()), credentials, registry);
    let service = engine.service();
    let progress = FollowProgress::start(manifest.jobs.len());

    let mut ids = Vec::new();
    for description in manifest.jobs {
        match service.submit_job(description).await {
            Ok(id) => ids.push(id),
            Err(e) => progress.note(&format!("rejected ({}): {e}", e.kind())),
        }
    }

    let deadline = Instant::now() + limit;
    let tick = config.poll_interval().min(Duration::from_secs(2));
    let views = loop {
        let mut views: Vec<JobView> = Vec::with_capacity(ids.len());
        for id in &ids {
            views.push(service.get_job(id).await?);
        }
        progress.update(&views);
        if views.iter().all(|v| v.status.is_terminal()) {
            break views;
        }
        if Instant::now() >= deadline {
            progress.note(&format!("gave up following after {}s", limit.as_secs()));
            break views;
        }
        tokio::time::sleep(tick).await;
    };

    progress.finish(&views);
    for view in &views {
        progress.print_view(view);
    }
    engine.shutdown().await;
    Ok(())
}
