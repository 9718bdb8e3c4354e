//! devsync - keeps a local view of remote project servers in sync.
//!
//! Saved servers live in a newline-delimited state file. `devsync watch`
//! connects to all of them, retries the ones that are down and prints every
//! project change until interrupted. The other subcommands are one-shot.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser as ClapParser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use devsync::collab::TcpAttacher;
use devsync::config::{self, SyncConfig};
use devsync::debug::{DebugCoordinator, DebugOptions};
use devsync::project::{Ports, Project, ProjectUpdate, StartMode};
use devsync::store::{FileSessionStore, SessionStore};
use devsync::supervisor::RetryPolicy;
use devsync::{ConnectionUri, Session, SessionContext, SessionRegistry};

/// devsync - keeps a local view of remote project servers in sync
#[derive(ClapParser, Debug)]
#[command(name = "devsync", version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/devsync/config.toml)
    #[arg(long, global = true, env = "DEVSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to every saved server and print project changes
    Watch,

    /// Connect to a server and save it
    Add {
        /// Base URI, e.g. http://10.0.1.10:9090
        uri: String,
    },

    /// Forget a saved server
    Remove { uri: String },

    /// List saved servers
    List,

    /// Show a server's projects
    Projects { uri: String },

    /// Restart a project
    Restart {
        uri: String,
        /// Project ID
        project: String,

        /// run, debug or debugNoInit
        #[arg(long, default_value = "run")]
        mode: StartMode,

        /// Attach a debugger once the project is back up (implies --mode debug)
        #[arg(long)]
        attach: bool,
    },

    /// Write a config file with the default settings
    InitConfig {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run a build action on a project
    Build {
        uri: String,
        /// Project ID
        project: String,

        #[arg(long, default_value = "build")]
        action: String,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "devsync=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    if let Commands::InitConfig { force } = cli.command {
        return init_config(cli.config, force);
    }
    let config = SyncConfig::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Watch => watch(&config).await,
        Commands::Add { uri } => add(&config, &uri).await,
        Commands::Remove { uri } => remove(&config, &uri),
        Commands::List => list(&config),
        Commands::Projects { uri } => projects(&config, &uri).await,
        Commands::Restart {
            uri,
            project,
            mode,
            attach,
        } => restart(&config, &uri, &project, mode, attach).await,
        Commands::InitConfig { .. } => Ok(()),
        Commands::Build {
            uri,
            project,
            action,
        } => {
            let session = connect(&config, &uri).await?;
            let result = session.request_build(&project, &action).await;
            session.close();
            result.with_context(|| format!("build of {} failed", project))?;
            println!("build '{}' requested for {}", action, project);
            Ok(())
        }
    }
}

fn init_config(path: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = path
        .or_else(config::default_path)
        .context("no config directory found; pass --config")?;
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to replace it)", path.display());
    }
    SyncConfig::default()
        .save(&path)
        .with_context(|| format!("cannot write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn store(config: &SyncConfig) -> anyhow::Result<FileSessionStore> {
    let path = config
        .state_path()
        .context("no data directory found; set state_file in the config")?;
    Ok(FileSessionStore::new(path))
}

fn registry(config: &SyncConfig) -> anyhow::Result<SessionRegistry> {
    let ctx = SessionContext::headless(config)?;
    Ok(SessionRegistry::new(
        ctx,
        Arc::new(store(config)?),
        RetryPolicy::from(&config.timeouts),
    ))
}

async fn connect(config: &SyncConfig, raw: &str) -> anyhow::Result<Arc<Session>> {
    let uri = ConnectionUri::parse(raw)?;
    let ctx = SessionContext::headless(config)?;
    Session::connect(uri, &ctx)
        .await
        .with_context(|| format!("cannot connect to {}", raw))
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
    cancel
}

async fn watch(config: &SyncConfig) -> anyhow::Result<()> {
    let registry = registry(config)?;
    let connected = registry.load().await?;
    println!("{} server(s) connected", connected);
    for broken in registry.broken() {
        println!("{}  not connected ({:?})", broken.uri, broken.status);
    }
    for invalid in registry.invalid() {
        println!("{}  invalid, remove it with `devsync remove`", invalid);
    }

    let cancel = interrupt_token();
    let mut watched = HashSet::new();
    let mut rescan = tokio::time::interval(config.timeouts.reconnect_delay());
    loop {
        for session in registry.sessions() {
            if watched.insert(session.uri().clone()) {
                spawn_printer(session, cancel.clone());
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = rescan.tick() => {}
        }
    }

    registry.shutdown().await;
    Ok(())
}

fn spawn_printer(session: Arc<Session>, cancel: CancellationToken) {
    let mut updates = session.subscribe();
    for project in session.projects().all() {
        print_project(session.uri(), &project);
    }
    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => return,
                update = updates.recv() => update,
            };
            match update {
                Ok(ProjectUpdate::Changed(p)) => println!(
                    "{}  {}  {}  {}  {}",
                    session.uri(),
                    p.id,
                    p.run_state.as_str(),
                    format_ports(p.ports),
                    p.annotation.unwrap_or_default()
                ),
                Ok(ProjectUpdate::Deleted { id }) => println!("{}  {}  deleted", session.uri(), id),
                Ok(ProjectUpdate::Refreshed { count }) => {
                    println!("{}  {} project(s)", session.uri(), count)
                }
                Ok(ProjectUpdate::ConnectionLost { reason }) => {
                    println!("{}  connection lost: {}", session.uri(), reason)
                }
                Ok(ProjectUpdate::ConnectionRestored) => {
                    println!("{}  connection restored", session.uri())
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(uri = %session.uri(), skipped = n, "update printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

async fn add(config: &SyncConfig, raw: &str) -> anyhow::Result<()> {
    let store = store(config)?;
    let mut saved = store.load()?;
    let session = connect(config, raw).await?;
    println!(
        "connected to {} (version {}, workspace {}, {} projects)",
        session.uri(),
        session.version(),
        session.workspace().display(),
        session.projects().len()
    );
    session.close();

    let uri = session.uri().to_string();
    if saved.contains(&uri) {
        println!("{} was already saved", uri);
    } else {
        saved.push(uri);
        store.save(&saved)?;
    }
    Ok(())
}

/// Matches by normalized URI, or verbatim for lines that never parsed.
fn remove(config: &SyncConfig, raw: &str) -> anyhow::Result<()> {
    let raw = raw.trim();
    let target = ConnectionUri::parse(raw).ok();
    let store = store(config)?;
    let before = store.load()?;
    let after: Vec<String> = before
        .iter()
        .filter(|saved| {
            let same = match (&target, ConnectionUri::parse(saved)) {
                (Some(target), Ok(uri)) => uri == *target,
                _ => saved.as_str() == raw,
            };
            !same
        })
        .cloned()
        .collect();
    if after.len() == before.len() {
        anyhow::bail!("{} is not saved", raw);
    }
    store.save(&after)?;
    println!("removed {}", raw);
    Ok(())
}

fn list(config: &SyncConfig) -> anyhow::Result<()> {
    for uri in store(config)?.load()? {
        println!("{}", uri);
    }
    Ok(())
}

async fn projects(config: &SyncConfig, raw: &str) -> anyhow::Result<()> {
    let session = connect(config, raw).await?;
    for project in session.projects().all() {
        print_project(session.uri(), &project);
    }
    session.close();
    Ok(())
}

async fn restart(
    config: &SyncConfig,
    raw: &str,
    project: &str,
    mode: StartMode,
    attach: bool,
) -> anyhow::Result<()> {
    let session = connect(config, raw).await?;
    if session.project_by_id(project).await.is_none() {
        session.close();
        anyhow::bail!("no project {} on {}", project, session.uri());
    }

    let result = if attach {
        let mode = if mode.is_debug() { mode } else { StartMode::Debug };
        let coordinator = DebugCoordinator::new(
            Arc::new(TcpAttacher),
            DebugOptions::from(&config.timeouts),
        );
        let cancel = interrupt_token();
        coordinator
            .restart_and_attach(&session, project, mode, &cancel)
            .await
            .map(|attached| {
                println!(
                    "debugger attached to {}:{} after {} attempt(s)",
                    attached.handle.host, attached.port, attached.attempts
                );
            })
            .map_err(anyhow::Error::from)
    } else {
        session
            .request_restart(project, mode)
            .await
            .map(|()| println!("restart ({}) requested for {}", mode.as_str(), project))
            .map_err(anyhow::Error::from)
    };
    session.close();
    result
}

fn print_project(uri: &ConnectionUri, project: &Project) {
    let snapshot = project.snapshot();
    println!(
        "{}  {}  {:<24}  {:<8}  {}  {}",
        uri,
        snapshot.id,
        snapshot.name,
        snapshot.run_state.as_str(),
        format_ports(snapshot.ports),
        snapshot.annotation.unwrap_or_default()
    );
}

fn format_ports(ports: Ports) -> String {
    let show = |p: Option<u16>| p.map_or_else(|| "-".to_string(), |p| p.to_string());
    format!("http:{} debug:{}", show(ports.http), show(ports.debug))
}
