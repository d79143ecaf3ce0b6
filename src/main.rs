use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use funcgate::builder::{self, BuildManager, BuilderServer};
use funcgate::cache::{start_idle_sweeper, FnServiceMap, UpdateLocks};
use funcgate::config::Config;
use funcgate::executor::{
    spawn_release_worker, ExecutorSet, NewDeployExecutor, PoolExecutor,
};
use funcgate::observability::{AccessLog, RouterMetrics};
use funcgate::orchestrator::Orchestrator;
use funcgate::proxy::FunctionProxy;
use funcgate::resolver::{start_invalidation_task, FunctionResolver};
use funcgate::router::{self, RouterState, TriggerSet};
use funcgate::storage::{BlobStore, HttpBlobStore, MemoryBlobStore};
use funcgate::store::MemoryStore;
use funcgate::triggers::{
    start_mq_controller, start_timer_controller, start_watch_controller, FunctionInvoker,
    MemoryQueue, MqController, TimerController, WatchController,
};

/// Funcgate — cold-start-avoiding function dispatch
#[derive(Parser)]
#[command(name = "funcgate", version, about)]
struct Cli {
    /// Path to configuration file (.hcl)
    #[arg(short, long, default_value = "funcgate.hcl")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without starting anything
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long, default_value = "funcgate.hcl")]
        config: String,
    },
    /// Run only the build server (inside a builder pod)
    Builder {
        /// Listen address
        #[arg(long, default_value = "0.0.0.0:8001")]
        listen: String,

        /// Volume shared with the build manager
        #[arg(long, default_value = "/userfunc")]
        shared_volume: String,
    },
}

#[tokio::main]
async fn main() -> funcgate::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Validate { config: config_path }) = &cli.command {
        return validate_config(config_path).await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    if let Some(Commands::Builder {
        listen,
        shared_volume,
    }) = &cli.command
    {
        return run_builder(listen, shared_volume).await;
    }

    tracing::info!("Funcgate v{}", env!("CARGO_PKG_VERSION"));

    let config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        Config::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        Config::default()
    };
    config.validate()?;

    run(config).await
}

/// Wire every component and serve until interrupted
async fn run(config: Config) -> funcgate::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let blob: Arc<dyn BlobStore> = match &config.storage.url {
        Some(url) => Arc::new(HttpBlobStore::new(url.clone())),
        None => Arc::new(MemoryBlobStore::new()),
    };

    #[cfg(feature = "kube")]
    let orchestrator: Arc<dyn Orchestrator> =
        Arc::new(funcgate::orchestrator::K8sOrchestrator::new(8888).await?);
    #[cfg(not(feature = "kube"))]
    let orchestrator: Arc<dyn Orchestrator> =
        Arc::new(funcgate::orchestrator::MockOrchestrator::new());

    let pool = Arc::new(PoolExecutor::new(
        orchestrator.clone(),
        store.clone(),
        blob.clone(),
        config.namespaces.runtime.clone(),
        config.pool.max_queue as usize,
    ));
    let newdeploy = Arc::new(NewDeployExecutor::new(
        orchestrator.clone(),
        store.clone(),
        blob.clone(),
        config.namespaces.runtime.clone(),
    ));
    let executors = Arc::new(ExecutorSet::new(pool, newdeploy));

    let services = Arc::new(FnServiceMap::new());
    let evicted = start_idle_sweeper(
        services.clone(),
        config.idle_timeout(),
        Duration::from_secs(10),
    );
    spawn_release_worker(evicted, executors.clone());

    let resolver = Arc::new(FunctionResolver::new(store.clone(), config.resolver_ttl()));
    start_invalidation_task(resolver.clone());

    let triggers = TriggerSet::new();
    router::start_sync(triggers.clone(), store.clone());

    let state = Arc::new(RouterState {
        triggers,
        resolver,
        services,
        locks: UpdateLocks::new(config.lock_timeout()),
        executors,
        proxy: FunctionProxy::new(),
        store: store.clone(),
        orchestrator: orchestrator.clone(),
        storage_url: config.storage.url.clone(),
        storage_client: reqwest::Client::new(),
        default_namespace: config.namespaces.default.clone(),
        metrics: Arc::new(RouterMetrics::new()),
        access_log: Arc::new(AccessLog::new()),
    });
    let (router_addr, _router) = router::serve(config.router_addr()?, state).await?;
    tracing::info!(addr = %router_addr, "Router listening");

    let manager = Arc::new(BuildManager::new(
        store.clone(),
        blob,
        orchestrator.clone(),
        config.storage.shared_volume.clone(),
        config.namespaces.builder.clone(),
        config.build_lease_timeout(),
    ));
    builder::start(manager);

    let invoker = Arc::new(FunctionInvoker::new(format!("http://{}", router_addr)));
    start_timer_controller(TimerController::new(store.clone(), invoker.clone()));
    start_mq_controller(MqController::new(
        store.clone(),
        MemoryQueue::new(),
        invoker.clone(),
    ));
    start_watch_controller(WatchController::new(store, orchestrator, invoker));

    tracing::info!("Funcgate ready — press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(funcgate::Error::Io)?;
    tracing::info!("Shutting down");
    Ok(())
}

/// Build-server-only mode, for the builder container image
async fn run_builder(listen: &str, shared_volume: &str) -> funcgate::Result<()> {
    let addr = listen
        .parse()
        .map_err(|e| funcgate::Error::Config(format!("Bad listen address: {}", e)))?;
    let server = Arc::new(BuilderServer::new(shared_volume));
    let (bound, handle) = builder::serve(addr, server).await?;
    tracing::info!(addr = %bound, volume = shared_volume, "Build server listening");
    tokio::select! {
        _ = handle => {}
        result = tokio::signal::ctrl_c() => {
            result.map_err(funcgate::Error::Io)?;
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}

/// Validate a configuration file and print diagnostics
async fn validate_config(path: &str) -> funcgate::Result<()> {
    if !std::path::Path::new(path).exists() {
        eprintln!("✗ Config file not found: {}", path);
        std::process::exit(1);
    }

    let config = match Config::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid");
    println!();
    println!("  Router:    {}", config.listen.router);
    println!("  Builder:   {}", config.listen.builder);
    println!(
        "  Namespaces: default={} runtime={} builder={}",
        config.namespaces.default, config.namespaces.runtime, config.namespaces.builder
    );
    println!(
        "  Pool:      size={} max_queue={} idle_timeout={}s",
        config.pool.size, config.pool.max_queue, config.pool.idle_timeout_secs
    );
    println!(
        "  Timeouts:  specialization={}s execution={}s lock={}s",
        config.timeouts.specialization_secs,
        config.timeouts.execution_secs,
        config.timeouts.lock_secs
    );
    match &config.storage.url {
        Some(url) => println!("  Storage:   {}", url),
        None => println!("  Storage:   in-memory"),
    }

    Ok(())
}
