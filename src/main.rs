mod agent;
mod backoff;
mod classify;
mod command;
mod config;
mod config_store;
mod connectivity;
mod data_dir;
mod health;
mod logging;
mod manual;
mod model;
mod processes;
mod recovery;
mod service;
mod signals;
mod status;
#[cfg(test)]
mod testing;
mod watchdog;

use agent::AgentCli;
use clap::{Parser, Subcommand};
use config::{secs, SupervisorConfig};
use config_store::{ConfigStore, FileConfigStore, Secret};
use connectivity::{ConnectivityProbe, TcpProbe};
use data_dir::DataDir;
use health::HealthEvaluator;
use manual::ManualInterventionDetector;
use processes::{ProcessInspector, SystemProcesses};
use recovery::{RecoveryDeps, RecoveryOrchestrator};
use signals::Shutdown;
use status::{StatusFile, StatusTracker};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use watchdog::{MonitorHandle, MonitorLoop};

/// Self-healing supervisor that keeps the Tailscale agent connected:
/// watch its health, repair the service and authentication when they
/// break, and back off when repairs keep failing.
#[derive(Parser, Debug)]
#[command(name = "tailguard", version, about)]
pub struct Cli {
    /// Supervisor settings file
    #[arg(short, long, global = true, default_value = "tailguard.toml")]
    config: PathBuf,

    /// Debug logging (probe results, backoff decisions)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the monitor loop until stopped
    Service {
        /// Auth key to persist before starting
        secret: Option<String>,
    },
    /// Persist the auth key and options
    Setup {
        /// Auth key used for non-interactive authentication
        secret: String,

        /// Hostname to register instead of the machine hostname
        #[arg(long)]
        hostname: Option<String>,

        /// Tag to advertise (repeatable; replaces the default tags)
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Do not accept subnet routes from the tailnet
        #[arg(long)]
        no_accept_routes: bool,

        /// Seconds between health checks
        #[arg(long)]
        interval: Option<u64>,

        /// Start the monitor loop after saving
        #[arg(long)]
        start: bool,
    },
    /// Run one health evaluation and print it as JSON
    Test,
    /// Print the running supervisor's state
    Status,
    /// Create the data directory and default config
    Init,
}

/// Log directory for invocations that run the monitor loop, if file
/// logging is enabled.
fn file_log_dir(command: &Commands, settings: &SupervisorConfig) -> Option<PathBuf> {
    let runs_monitor = matches!(
        command,
        Commands::Service { .. } | Commands::Setup { start: true, .. }
    );
    if !runs_monitor || !settings.logging.file {
        return None;
    }
    let data_dir = DataDir::new(&settings.storage.data_dir);
    Some(logging::log_dir(&settings.logging, &data_dir))
}

/// Every long-lived component, wired together.
struct Supervisor {
    evaluator: HealthEvaluator,
    orchestrator: RecoveryOrchestrator,
}

fn compose(settings: &SupervisorConfig, store: Arc<dyn ConfigStore>, shutdown: Shutdown) -> Supervisor {
    let agent = Arc::new(AgentCli::new(
        &settings.agent,
        Arc::clone(&store),
        shutdown.clone(),
    ));
    let service = service::from_config(&settings.service, shutdown.clone());
    let connectivity: Arc<dyn ConnectivityProbe> = Arc::new(TcpProbe::new(shutdown.clone()));
    let processes: Arc<dyn ProcessInspector> = Arc::new(SystemProcesses::new(
        secs(settings.agent.process_list_timeout_secs),
        shutdown.clone(),
    ));
    let detector = Arc::new(ManualInterventionDetector::new(
        &settings.agent,
        processes,
        agent.clone(),
        Arc::clone(&service),
    ));
    let evaluator = HealthEvaluator::new(
        settings,
        agent.clone(),
        Arc::clone(&service),
        Arc::clone(&connectivity),
        Arc::clone(&detector),
    );
    let orchestrator = RecoveryOrchestrator::new(
        settings,
        RecoveryDeps {
            probe: agent.clone(),
            agent,
            service,
            connectivity,
            detector,
            store,
        },
        shutdown,
    );
    Supervisor {
        evaluator,
        orchestrator,
    }
}

fn open_store(settings: &SupervisorConfig) -> Result<(DataDir, Arc<FileConfigStore>), String> {
    let data_dir = DataDir::new(&settings.storage.data_dir);
    data_dir
        .init()
        .map_err(|e| format!("cannot create {}: {e}", data_dir.root().display()))?;
    let store = Arc::new(FileConfigStore::new(&data_dir));
    Ok((data_dir, store))
}

/// Run the monitor until SIGINT/SIGTERM.
async fn handle_service(settings: &SupervisorConfig, secret: Option<String>) -> Result<(), String> {
    let (data_dir, store) = open_store(settings)?;

    if let Some(secret) = secret {
        save_secret(store.as_ref(), Secret::new(secret))?;
    }
    let config = store.load().map_err(|e| e.to_string())?;
    if config.secret().is_none() {
        return Err("no auth key configured, run `tailguard setup <key>` first".to_string());
    }

    let (trigger, shutdown) = signals::channel();
    let supervisor = compose(settings, store.clone(), shutdown.clone());
    let monitor = MonitorLoop::new(
        &settings.monitor,
        supervisor.evaluator,
        supervisor.orchestrator,
        store,
        shutdown,
    )
    .with_status(StatusTracker::new(data_dir.status()));

    tracing::info!(
        service = %settings.service.name,
        check_interval_secs = config.check_interval_secs,
        "tailguard starting"
    );
    let mut handle = MonitorHandle::spawn(monitor, trigger);
    tokio::select! {
        _ = signals::wait_for_stop_signal() => {}
        _ = handle.finished() => {
            return Err("monitor loop exited unexpectedly".to_string());
        }
    }

    if !handle.stop(secs(settings.monitor.join_timeout_secs)).await {
        return Err("monitor loop did not stop in time".to_string());
    }
    tracing::info!("tailguard stopped");
    Ok(())
}

fn save_secret(store: &dyn ConfigStore, secret: Secret) -> Result<(), String> {
    if secret.is_empty() {
        return Err("auth key must not be empty".to_string());
    }
    store
        .update(&mut |cfg| {
            cfg.auth_secret = Some(secret.clone());
            cfg.configured_at = Some(chrono::Utc::now());
        })
        .map(|_| ())
        .map_err(|e| e.to_string())
}

struct SetupOptions {
    secret: String,
    hostname: Option<String>,
    tags: Vec<String>,
    no_accept_routes: bool,
    interval: Option<u64>,
}

fn handle_setup(settings: &SupervisorConfig, opts: SetupOptions) -> Result<(), String> {
    let secret = Secret::new(opts.secret);
    if secret.is_empty() {
        return Err("auth key must not be empty".to_string());
    }
    if opts.interval == Some(0) {
        return Err("--interval must be at least 1 second".to_string());
    }

    let (_, store) = open_store(settings)?;
    let saved = store
        .update(&mut |cfg| {
            cfg.auth_secret = Some(secret.clone());
            cfg.configured_at = Some(chrono::Utc::now());
            if let Some(hostname) = &opts.hostname {
                cfg.hostname_override = Some(hostname.clone());
            }
            if !opts.tags.is_empty() {
                cfg.tags = opts.tags.clone();
            }
            if opts.no_accept_routes {
                cfg.accept_routes = false;
            }
            if let Some(interval) = opts.interval {
                cfg.check_interval_secs = interval;
            }
        })
        .map_err(|e| e.to_string())?;

    tracing::info!(path = %store.path().display(), "configuration saved");
    println!("Configuration saved to {}", store.path().display());
    println!("  hostname:       {}", saved.hostname_override.as_deref().unwrap_or("(machine hostname)"));
    println!("  tags:           {}", saved.tags.join(","));
    println!("  accept routes:  {}", saved.accept_routes);
    println!("  check interval: {}s", saved.check_interval_secs);
    Ok(())
}

/// One evaluation, printed as JSON.
async fn handle_test(settings: &SupervisorConfig) -> Result<(), String> {
    let (_, store) = open_store(settings)?;
    let supervisor = compose(settings, store, Shutdown::never());
    let report = supervisor.evaluator.evaluate().await;
    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn handle_status(settings: &SupervisorConfig) -> Result<(), String> {
    let file = StatusFile::new(DataDir::new(&settings.storage.data_dir).status());
    match file.read().map_err(|e| e.to_string())? {
        Some(data) => {
            println!("pid:                  {}", data.pid);
            println!("state:                {}", data.state);
            println!("consecutive failures: {}", data.consecutive_failures);
            match data.last_success {
                Some(at) => println!("last success:         {}", at.to_rfc3339()),
                None => println!("last success:         never"),
            }
            if !data.last_reasons.is_empty() {
                let reasons: Vec<String> = data.last_reasons.iter().map(ToString::to_string).collect();
                println!("last reasons:         {}", reasons.join(", "));
            }
            if !data.last_steps.is_empty() {
                let steps: Vec<String> = data.last_steps.iter().map(ToString::to_string).collect();
                println!("last recovery:        {}", steps.join(", "));
            }
            println!("updated:              {}", data.last_update.to_rfc3339());
        }
        None => println!("No supervisor running ({} not found)", file.path().display()),
    }
    Ok(())
}

fn handle_init(settings: &SupervisorConfig) -> Result<(), String> {
    let data_dir = DataDir::new(&settings.storage.data_dir);
    let created = data_dir
        .init()
        .map_err(|e| format!("cannot create {}: {e}", data_dir.root().display()))?;
    let store = FileConfigStore::new(&data_dir);
    if !store.path().exists() {
        let defaults = store.load().map_err(|e| e.to_string())?;
        store.save(&defaults).map_err(|e| e.to_string())?;
    }
    tracing::info!(data_dir = %data_dir.root().display(), created, "data directory ready");
    println!("data dir: {}", data_dir.root().display());
    println!("config:   {}", data_dir.config().display());
    println!("status:   {}", data_dir.status().display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match config::load(&cli.config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_dir = file_log_dir(&cli.command, &settings);
    if log_dir.is_some() {
        // Create the data dir with its restricted mode before logs/ lands in it.
        // A failure here resurfaces from open_store.
        let _ = DataDir::new(&settings.storage.data_dir).init();
    }
    let _log_guard = logging::init(
        logging::Verbosity::from_flags(cli.verbose, cli.quiet),
        log_dir.as_deref().map(|dir| (dir, settings.logging.max_files)),
    );

    let result = match cli.command {
        Commands::Service { secret } => handle_service(&settings, secret).await,
        Commands::Setup {
            secret,
            hostname,
            tags,
            no_accept_routes,
            interval,
            start,
        } => {
            let saved = handle_setup(
                &settings,
                SetupOptions {
                    secret,
                    hostname,
                    tags,
                    no_accept_routes,
                    interval,
                },
            );
            match saved {
                Ok(()) if start => handle_service(&settings, None).await,
                other => other,
            }
        }
        Commands::Test => handle_test(&settings).await,
        Commands::Status => handle_status(&settings),
        Commands::Init => handle_init(&settings),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
