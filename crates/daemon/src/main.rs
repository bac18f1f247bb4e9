//! i3pm daemon entry point.
//!
//! Startup order: configuration and logging, window manager connection,
//! state store (garbage collected against the live tree), switch queue, RPC
//! server, event subscription. The main loop then dispatches events in the
//! order the window manager emits them until a signal, a manager shutdown or
//! a lost event stream stops it.

use anyhow::{Context, Result};
use clap::Parser;
use i3pm_core::{Clock, ManagerEvent, SystemClock, WindowManager};
use i3pm_daemon::config::{Config, ConfigWarning};
use i3pm_daemon::queue::RESULT_CHANNEL_CAPACITY;
use i3pm_daemon::{
    rpc, AppRegistry, DispatchSettings, Dispatcher, FilterEngine, FilterSettings, Flow,
    ProjectCatalog, RpcContext, StateStore, SwitchQueue,
};
use i3pm_platform_sway::{socket_path_from_env, EventKind, ProcEnvironment, SwayClient};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Events that the daemon event loop processes.
enum DaemonEvent {
    /// An event from the window manager subscription.
    Manager(ManagerEvent),
    /// The subscription connection closed.
    EventStreamClosed,
    /// Ctrl+C or SIGTERM.
    Signal(&'static str),
}

#[derive(Debug, Parser)]
#[command(name = "i3pm-daemon", version, about = "Project-scoped window filtering for i3 and sway")]
struct Args {
    /// Config file (default: search the standard locations).
    #[arg(long)]
    config: Option<PathBuf>,
    /// State file holding window placements.
    #[arg(long)]
    state: Option<PathBuf>,
    /// RPC socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Window manager IPC socket (default: $SWAYSOCK, then $I3SOCK).
    #[arg(long)]
    manager_socket: Option<PathBuf>,
    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(state) = &args.state {
        config.state.path = Some(state.clone());
    }
    if let Some(socket) = &args.socket {
        config.rpc.socket_path = Some(socket.clone());
    }
    if let Some(socket) = &args.manager_socket {
        config.manager.socket_path = Some(socket.clone());
    }
    if let Some(level) = &args.log_level {
        config.behavior.log_level = level.clone();
    }
    Ok(config)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Forward the subscription into the main event channel.
fn spawn_event_forwarder(
    mut events: mpsc::Receiver<ManagerEvent>,
    event_tx: mpsc::Sender<DaemonEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if event_tx.send(DaemonEvent::Manager(event)).await.is_err() {
                return; // Daemon shutting down
            }
        }
        let _ = event_tx.send(DaemonEvent::EventStreamClosed).await;
    })
}

/// Turn Ctrl+C and SIGTERM into shutdown events.
fn spawn_signal_handler(event_tx: mpsc::Sender<DaemonEvent>) -> Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        let _ = event_tx.send(DaemonEvent::Signal(name)).await;
    });
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (needed for log level)
    let mut config = load_config(&args).unwrap_or_else(|e| {
        // Can't use tracing yet, fall back to eprintln
        eprintln!("Failed to load configuration: {:#}. Using defaults.", e);
        Config::default()
    });
    init_logging(&config.behavior.log_level);

    let config_warnings: Vec<ConfigWarning> = config.validate();
    for w in &config_warnings {
        warn!("Config: {} - {}", w.field, w.message);
    }

    info!("i3pm daemon starting, version {}", env!("CARGO_PKG_VERSION"));

    let registry = match &config.registry_path {
        Some(path) => AppRegistry::load(path).unwrap_or_else(|e| {
            warn!("{}. Continuing without an application registry.", e);
            AppRegistry::default()
        }),
        None => AppRegistry::default(),
    };
    info!("Application registry: {} entries", registry.len());

    let catalog = match &config.projects_dir {
        Some(dir) => match ProjectCatalog::load_dir(dir) {
            Ok(catalog) => {
                info!("Project catalog: {} projects", catalog.len());
                Some(Arc::new(catalog))
            }
            Err(e) => {
                warn!("{}. Accepting any project name.", e);
                None
            }
        },
        None => None,
    };

    // Window manager
    let manager_socket = match &config.manager.socket_path {
        Some(path) => path.clone(),
        None => socket_path_from_env()?,
    };
    let manager = Arc::new(
        SwayClient::connect_with_retry(&manager_socket, config.manager.retry_policy())
            .await
            .with_context(|| format!("Window manager unreachable at {}", manager_socket.display()))?,
    );
    info!("Connected to window manager at {}", manager_socket.display());

    // State store
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state_path = config.state_path();
    let store = StateStore::load(&state_path, config.state.max_records, Arc::clone(&clock)).await;
    let store = Arc::new(Mutex::new(store));

    match manager.query_tree().await {
        Ok(windows) => {
            let live: HashSet<_> = windows.iter().map(|w| w.id).collect();
            let mut store = store.lock().await;
            if let Err(e) = store.garbage_collect(&live).await {
                warn!("Failed to persist garbage collection: {}", e);
            }
            info!(
                "{} live windows, {} tracked placements",
                live.len(),
                store.len()
            );
        }
        Err(e) => warn!("Skipping startup garbage collection: {}", e),
    }

    // Filtering engine and queue
    let env = Arc::new(ProcEnvironment::new());
    let engine = Arc::new(FilterEngine::new(
        Arc::clone(&manager),
        Arc::clone(&env),
        Arc::clone(&store),
        FilterSettings::from(&config.filter),
    ));
    let (results_tx, _) = broadcast::channel(RESULT_CHANNEL_CAPACITY);
    let (queue, worker) = SwitchQueue::spawn(Arc::clone(&engine), results_tx.clone(), Arc::clone(&clock));

    // RPC server
    let rpc_path = config.rpc_socket_path();
    let listener = rpc::bind(&rpc_path).await?;
    let ctx = Arc::new(RpcContext {
        engine: Arc::clone(&engine),
        queue: queue.clone(),
        catalog,
    });
    let rpc_task = tokio::spawn(rpc::run_rpc_server(listener, ctx, results_tx));
    info!("RPC server listening on {}", rpc_path.display());

    // Events
    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(256);
    let subscription = manager
        .subscribe(&[
            EventKind::Window,
            EventKind::Workspace,
            EventKind::Output,
            EventKind::Tick,
            EventKind::Shutdown,
        ])
        .await
        .context("Failed to subscribe to window manager events")?;
    let forwarder = spawn_event_forwarder(subscription, event_tx.clone());
    spawn_signal_handler(event_tx.clone())?;

    let dispatcher = Dispatcher::new(
        Arc::clone(&manager),
        env,
        Arc::clone(&store),
        Arc::new(registry),
        queue,
        DispatchSettings {
            tick_prefix: config.behavior.switch_tick_prefix.clone(),
            apply_preferred_workspace: config.behavior.apply_preferred_workspace,
        },
    );

    info!("Ready.");

    while let Some(event) = event_rx.recv().await {
        match event {
            DaemonEvent::Manager(event) => {
                if dispatcher.handle(&event).await == Flow::Shutdown {
                    break;
                }
            }
            DaemonEvent::EventStreamClosed => {
                error!("Lost the window manager event stream");
                break;
            }
            DaemonEvent::Signal(name) => {
                info!("{} received, initiating shutdown...", name);
                break;
            }
        }
    }

    info!("Shutting down");
    rpc_task.abort();
    forwarder.abort();
    worker.shutdown().await;
    if let Err(e) = store.lock().await.flush().await {
        warn!("Failed to flush state: {}", e);
    }
    if let Err(e) = tokio::fs::remove_file(&rpc_path).await {
        debug!("Could not remove RPC socket: {}", e);
    }
    info!("Stopped");
    Ok(())
}
