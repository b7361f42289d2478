// src/lib.rs

pub mod agent;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod model;
pub mod schedule;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::agent::{load_private_key, AgentContext, AgentServer, AuthorizedKeys, PluginResolver, RemoteRunner};
use crate::cli::{CliArgs, Command};
use crate::config::{load_and_validate, AgentSettings, AuthorizedKeySource, ConfigFile};
use crate::engine::{Supervisor, SupervisorHandle};
use crate::exec::{Runner, TaskExecutor};

/// High-level entry point used by `main.rs`.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Supervisor { config, dry_run } => {
            let config_path = PathBuf::from(config);
            let cfg = load_and_validate(&config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;

            if dry_run {
                print_dry_run(&cfg);
                return Ok(());
            }
            run_supervisor(cfg, config_path).await
        }
        Command::Agent { config } => {
            let config_path = PathBuf::from(config);
            let cfg = load_and_validate(&config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;
            let agent = cfg
                .agent
                .context("config has no [agent] section and no SHIELD_AGENT_* overrides")?;
            run_agent(agent).await
        }
    }
}

/// Wires together:
/// - the production executor (local pipelines, SSH to agents)
/// - the supervisor loop
/// - Ctrl-C shutdown and SIGHUP job reload
async fn run_supervisor(cfg: ConfigFile, config_path: PathBuf) -> Result<()> {
    let settings = &cfg.supervisor;

    let mut runner = Runner::new(settings.task_timeout);
    match &settings.private_key_file {
        Some(path) => {
            runner = runner.with_remote(RemoteRunner::from_key_file(path, &settings.agent_user)?);
        }
        None => {
            if cfg.jobs.iter().any(|j| j.agent.is_some()) {
                warn!("some jobs target agents but [supervisor].private_key_file is not set; they will fail");
            }
        }
    }
    let executor: Arc<dyn TaskExecutor> = Arc::new(runner);

    info!(jobs = cfg.jobs.len(), "starting supervisor");
    let (supervisor, handle) = Supervisor::new(cfg.jobs, settings.options(), executor);

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; shutting down");
            let _ = handle.shutdown().await;
        });
    }

    #[cfg(unix)]
    spawn_reload_on_sighup(handle.clone(), config_path)?;
    #[cfg(not(unix))]
    let _ = config_path;

    // The supervisor stops once every handle is gone; keep ours alive until
    // it returns.
    let result = supervisor.run().await;
    drop(handle);
    Ok(result?)
}

#[cfg(unix)]
fn spawn_reload_on_sighup(handle: SupervisorHandle, config_path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!(path = %config_path.display(), "SIGHUP received; reloading jobs");
            match load_and_validate(&config_path) {
                Ok(cfg) => {
                    if handle.resync(cfg.jobs).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "reload failed; keeping current jobs"),
            }
        }
    });
    Ok(())
}

async fn run_agent(settings: AgentSettings) -> Result<()> {
    let authorized = match &settings.authorized_keys {
        AuthorizedKeySource::Inline(content) => AuthorizedKeys::parse(content),
        AuthorizedKeySource::File(path) => AuthorizedKeys::load(path)?,
    };
    if authorized.is_empty() {
        warn!("no usable authorized keys; every client will be rejected");
    }

    let host_key = load_private_key(&settings.host_key_file)?;
    let listener = TcpListener::bind(&settings.listen_address)
        .await
        .with_context(|| format!("binding {}", settings.listen_address))?;

    let context = AgentContext {
        name: settings.name.clone(),
        authorized,
        resolver: PluginResolver::new(settings.plugin_paths.clone()),
        task_timeout: settings.task_timeout,
    };
    let server = AgentServer::new(context, host_key);

    tokio::select! {
        res = server.serve(listener) => Ok(res?),
        res = tokio::signal::ctrl_c() => {
            res.context("listening for Ctrl+C")?;
            info!("Ctrl+C received; agent shutting down");
            Ok(())
        }
    }
}

/// Print jobs, their schedules and first run times.
fn print_dry_run(cfg: &ConfigFile) {
    let now = Utc::now();
    let s = &cfg.supervisor;

    println!("shield dry-run");
    println!("  supervisor.workers = {}", s.workers);
    println!("  supervisor.tick_interval = {:?}", s.tick_interval);
    if let Some(timeout) = s.task_timeout {
        println!("  supervisor.task_timeout = {timeout:?}");
    }
    println!();

    println!("jobs ({}):", cfg.jobs.len());
    for job in &cfg.jobs {
        println!("  - {} ({})", job.name, job.id);
        println!("      schedule: {}", job.schedule);
        match job.schedule.next_after(now) {
            Ok(next) => println!("      first run: {next}"),
            Err(e) => println!("      first run: <error: {e}>"),
        }
        println!("      target: {} / store: {}", job.target.plugin, job.store.plugin);
        if let Some(agent) = &job.agent {
            println!("      agent: {agent}");
        }
        if job.paused {
            println!("      paused: true");
        }
    }

    if let Some(agent) = &cfg.agent {
        println!();
        println!("agent {} on {}", agent.name, agent.listen_address);
        for path in &agent.plugin_paths {
            println!("  plugin path: {}", path.display());
        }
    }

    debug!("dry-run complete (no execution)");
}
