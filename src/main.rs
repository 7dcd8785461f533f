use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use l2overlay::cli::{self, Cli, Command};
use l2overlay::config;
use l2overlay::direct::DirectListener;
use l2overlay::event_loop::EventLoop;
use l2overlay::messaging::{LoopbackImClient, MessagingAdapter, PresenceStatus};
use l2overlay::peer_table::PeerTable;
use l2overlay::tap;

fn init_logging(debug: bool) {
    let filter = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start => start(cli.config.as_deref(), true),
        Command::Stand => start(cli.config.as_deref(), false),
        Command::Stop => {
            let config = config::load(cli.config.as_deref()).context("loading config")?;
            cli::stop(&config.pid_path).context("stopping daemon")
        }
        Command::Restart => {
            let config = config::load(cli.config.as_deref()).context("loading config")?;
            cli::stop(&config.pid_path).context("stopping daemon")?;
            start(cli.config.as_deref(), true)
        }
        Command::Status => {
            let config = config::load(cli.config.as_deref()).context("loading config")?;
            match cli::running_pid(&config.pid_path) {
                Some(pid) => println!("running, pid {}", pid),
                None => println!("not running"),
            }
            Ok(())
        }
    }
}

fn start(config_path: Option<&std::path::Path>, background: bool) -> Result<()> {
    let config = config::load(config_path).context("loading config")?;
    init_logging(config.debug);

    if cli::running_pid(&config.pid_path).is_some() {
        anyhow::bail!("a daemon is already running (pidfile {})", config.pid_path.display());
    }

    if background {
        let daemon = daemonize::Daemonize::new()
            .pid_file(&config.pid_path)
            .user(config.process_user.as_str())
            .group(config.process_group.as_str());
        daemon.start().context("daemonizing")?;
    } else {
        cli::write_pidfile(&config.pid_path).context("writing pidfile")?;
    }

    let result = run_overlay(&config);

    if !background {
        cli::remove_pidfile(&config.pid_path);
    }
    result
}

fn run_overlay(config: &config::Config) -> Result<()> {
    let tap = tap::open_platform_tap(&config.tap).context("opening tap device")?;

    let self_status = match config.external {
        Some(addr) => PresenceStatus::External {
            ip: config.tap.ip,
            mac: tap.mac(),
            external: addr,
        },
        None => PresenceStatus::Internal {
            ip: config.tap.ip,
            mac: tap.mac(),
        },
    };

    // `stand` and test deployments run against the crate's own loopback
    // transport; a production deployment links in a real `ImClient` and
    // calls `run<C>` directly instead of going through `main`.
    let (client, _peer_end) = LoopbackImClient::new_pair();
    let mut messaging = MessagingAdapter::new(client, config.account.clone(), config.password.clone(), self_status);
    messaging.start();

    let listener = match config.external {
        Some(addr) => Some(DirectListener::bind(addr).context("binding direct-link listener")?),
        None => None,
    };

    let table = PeerTable::new();
    let mut event_loop = EventLoop::new(tap, messaging, table, listener).context("initializing event loop")?;

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))
        .context("installing SIGTERM handler")?;

    info!("overlay running");
    event_loop.run_until(|| stop.load(Ordering::Relaxed))?;
    Ok(())
}
