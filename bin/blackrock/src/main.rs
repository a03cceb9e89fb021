//! ---
//! br_section: "05-cli"
//! br_subsection: "binary"
//! br_type: "source"
//! br_scope: "code"
//! br_description: "Binary entrypoint: fleet master, node agent, and delegated tools."
//! br_version: "v0.0.0-prealpha"
//! br_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use blackrock_cluster_rpc::AddressToken;
use blackrock_common::{init_tracing, BindSpec, FleetConfig, LogSinkSpec, SlaveConfig};
use blackrock_master::{assign_roles, CommandDriver};
use blackrock_node::{Acquisition, BootstrapOutcome, DaemonBootstrap, DaemonContext, ForkDetacher};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use tokio::runtime::Builder;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Blackrock cluster master and node agent",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Bring up the fleet described by a configuration file")]
    Master {
        #[arg(value_name = "CONFIG", help = "Fleet configuration file")]
        config: PathBuf,
        #[arg(short = 'r', long, help = "Replace any agents already running")]
        restart: bool,
    },
    #[command(about = "Start (or attach to) the node agent and print its address token")]
    Slave {
        #[arg(
            value_name = "BIND",
            help = "Address to listen on: a host, host:port, if4:<iface> or if6:<iface>"
        )]
        bind: BindSpec,
        #[arg(long, value_name = "ADDR/NAME", help = "Send daemon output to a log collector")]
        log: Option<LogSinkSpec>,
        #[arg(short = 'r', long, help = "Terminate a running agent and take its place")]
        restart: bool,
        #[arg(
            long,
            value_name = "DIR",
            env = "BLACKROCK_ROOT",
            hide = true,
            help = "Relocate guard, log, and role directories under DIR"
        )]
        root: Option<PathBuf>,
    },
    #[command(about = "Run the grain supervisor", disable_help_flag = true)]
    Grain {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
    #[command(about = "Unpack a package archive", disable_help_flag = true)]
    Unpack {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Master { config, restart } => run_master(config, restart),
        Commands::Slave {
            bind,
            log,
            restart,
            root,
        } => {
            let mut config = SlaveConfig::new(bind)
                .with_log_sink(log)
                .with_restart(restart);
            if let Some(root) = root {
                config = config.rooted_at(&root);
            }
            run_slave(Arc::new(config))
        }
        Commands::Grain { args } => delegate("blackrock-grain", args),
        Commands::Unpack { args } => delegate("blackrock-unpack", args),
    }
}

fn run_master(config_path: PathBuf, restart: bool) -> Result<()> {
    let loaded = FleetConfig::load_with_source(&[config_path])
        .context("load fleet configuration")?;
    let config = loaded.config;
    init_tracing("blackrock-master", &config.logging).context("initialise logging")?;
    info!(
        source = %loaded.source.display(),
        machines = config.machines.len(),
        restart,
        "master starting"
    );

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start runtime")?;
    runtime.block_on(async {
        let driver = CommandDriver::new(config.log_sink.clone(), config.launch_timeout);
        let fleet = assign_roles(&config, &driver, restart)
            .await
            .context("assign roles")?;
        info!(
            machines = fleet.len(),
            storage = %fleet.storage.token,
            workers = fleet.workers.len(),
            "fleet ready"
        );
        shutdown_signal().await;
        info!("master shutting down");
        Ok(())
    })
}

fn run_slave(config: Arc<SlaveConfig>) -> Result<()> {
    init_tracing("blackrock-slave", &config.logging).context("initialise logging")?;
    info!(bind = %config.bind, restart = config.restart, "slave starting");
    let bootstrap = DaemonBootstrap::new(config);

    // Acquisition needs timers; the runtime is gone again before the fork.
    let acquisition = {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .context("start runtime")?;
        runtime
            .block_on(bootstrap.acquire())
            .context("acquire singleton guard")?
    };

    let outcome = match acquisition {
        Acquisition::Attached(token) => BootstrapOutcome::Attached(token),
        Acquisition::Acquired(guard) => bootstrap
            .launch(guard, &ForkDetacher)
            .context("launch agent")?,
    };

    match outcome {
        BootstrapOutcome::Attached(token) | BootstrapOutcome::Serving(token) => {
            report_token(&token)
        }
        BootstrapOutcome::Daemon(context) => serve_daemon(&bootstrap, context),
    }
}

fn serve_daemon(bootstrap: &DaemonBootstrap, context: DaemonContext) -> Result<()> {
    let registry = Registry::new();
    let agent = bootstrap
        .build_agent(&registry)
        .context("build role agent")?;
    let runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("start runtime")?;
    runtime
        .block_on(context.serve(Arc::new(agent), shutdown_signal()))
        .context("serve agent")
}

/// The caller reads the raw token from stdout.
fn report_token(token: &AddressToken) -> Result<()> {
    info!(%token, "reporting address token");
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(&token.encode())
        .and_then(|()| stdout.flush())
        .context("write address token")
}

fn delegate(program: &str, args: Vec<OsString>) -> Result<()> {
    let err = Command::new(program).args(args).exec();
    Err(err).with_context(|| format!("exec {program}"))
}

async fn shutdown_signal() {
    tokio::select! {
        _ = ctrl_c() => {},
        _ = terminate() => {},
    }
}

async fn ctrl_c() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to install Ctrl+C handler");
    }
}

async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(err) => {
            warn!(?err, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}
