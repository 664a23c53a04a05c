//! Codexec Server - submission/status HTTP API, optionally with embedded workers.

use clap::Parser;
use codexec::api::router;
use codexec::config::{apply_env_overrides, load_config, load_config_from_path, validate_config};
use codexec::context::shutdown_signal;
use codexec::sandbox::{DockerSandbox, SandboxRunner};
use codexec::worker::Worker;
use codexec::{logging, AppContext};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

// ---- CLI ----

#[derive(Parser)]
#[command(name = "codexec-server", about = "Codexec submission and status API", version)]
struct Args {
    /// Config file (defaults to $CODEXEC_CONFIG or the user config dir)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Port
    #[arg(long, short)]
    port: Option<u16>,

    /// Workers to run inside this process. Defaults to 1 with in-memory
    /// storage and 0 with PostgreSQL.
    #[arg(long, env = "CODEXEC_EMBEDDED_WORKERS")]
    workers: Option<usize>,
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
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    logging::init(&config.log);

    for warning in validate_config(&config).into_result()? {
        warn!("Config: {}", warning);
    }

    let context = AppContext::init(config).await?;
    let config = context.config.clone();

    let workers = args
        .workers
        .unwrap_or(if context.is_shared() { 0 } else { 1 });
    if workers == 0 && !context.is_shared() {
        warn!("In-memory storage without embedded workers: submitted jobs will never run");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if workers > 0 {
        let sandbox = DockerSandbox::new(&config.sandbox, config.limits.output_cap_bytes).await?;
        let runner = SandboxRunner::new(Arc::new(sandbox), config.limits.output_cap_bytes);
        if config.sandbox.prepull_images {
            runner.prepare(&context.registry).await?;
        }

        for n in 0..workers {
            let id = format!("{}-{}", config.worker.id, n);
            let worker = Arc::new(Worker::new(id, &context, runner.clone()));
            tasks.spawn(worker.run(shutdown_rx.clone()));
        }
        info!("Started {} embedded workers", workers);
    }

    tasks.spawn(context.clone().run_housekeeping(shutdown_rx.clone()));

    // Build router
    let app = router(&context);

    // Bind and serve
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    info!("Codexec API listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping workers");
    shutdown_tx.send_replace(true);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Background task failed: {}", e),
            Err(e) => error!("Background task panicked: {}", e),
        }
    }

    context.shutdown().await;
    Ok(())
}
