//! Codexec Worker - claims jobs from the shared PostgreSQL queue and runs them.

use clap::Parser;
use codexec::config::{
    apply_env_overrides, load_config, load_config_from_path, validate_config, StorageBackendType,
};
use codexec::context::shutdown_signal;
use codexec::sandbox::{DockerSandbox, SandboxRunner};
use codexec::worker::Worker;
use codexec::{logging, AppContext};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

// ---- CLI ----

#[derive(Parser)]
#[command(name = "codexec-worker", about = "Codexec sandbox worker", version)]
struct Args {
    /// Config file (defaults to $CODEXEC_CONFIG or the user config dir)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Worker id (defaults to worker.id / $HOSTNAME)
    #[arg(long)]
    id: Option<String>,

    /// Concurrent sandboxes
    #[arg(long)]
    concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config);
            config
        }
        None => load_config()?,
    };
    if let Some(id) = args.id {
        config.worker.id = id;
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }

    logging::init(&config.log);

    for warning in validate_config(&config).into_result()? {
        warn!("Config: {}", warning);
    }

    if config.storage.backend != StorageBackendType::Postgres {
        anyhow::bail!(
            "A standalone worker needs shared storage. Set storage.postgres in the config file or DATABASE_URL."
        );
    }

    let context = AppContext::init(config).await?;
    let config = context.config.clone();

    let sandbox = DockerSandbox::new(&config.sandbox, config.limits.output_cap_bytes).await?;
    let runner = SandboxRunner::new(Arc::new(sandbox), config.limits.output_cap_bytes);
    if config.sandbox.prepull_images {
        runner.prepare(&context.registry).await?;
        info!("Runtime images ready");
    }

    let worker = Arc::new(Worker::new(config.worker.id.clone(), &context, runner));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_tx.send_replace(true);
    });

    let result = worker.run(shutdown_rx).await;

    context.shutdown().await;
    result?;
    Ok(())
}
