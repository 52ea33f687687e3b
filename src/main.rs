use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use peercall_rs::config::{Config, ConfigOverrides};
use peercall_rs::logging;
use peercall_rs::relay::ChannelStatus;
use peercall_rs::webrtc_link::{StaticMediaSource, WebRtcLinkFactory};
use peercall_rs::{CallEvent, Client};

#[derive(Parser, Debug)]
#[command(name = "peercall-rs", version)]
struct Cli {
    /// Path to config file
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Identity to register (overrides the config file)
    #[arg(long)]
    name: Option<String>,

    /// Relay websocket URL (overrides the config file)
    #[arg(long = "relay-url")]
    relay_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register and wait for incoming calls
    Listen,
    /// Register, then call the given identity
    Call { remote: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load_with_overrides(
        &cli.config,
        ConfigOverrides {
            identity: cli.name,
            relay_url: cli.relay_url,
        },
    )?;

    let log_path = cfg.log_file_path();
    logging::init_log_file(&log_path)?;
    logging::info(format!(
        "peercall start version={} identity={} relay={} log={}",
        env!("CARGO_PKG_VERSION"),
        cfg.identity,
        cfg.relay_url,
        log_path.display()
    ));

    let target = match cli.command {
        Commands::Listen => None,
        Commands::Call { remote } => Some(remote),
    };
    run(cfg, target).await
}

async fn run(cfg: Config, mut target: Option<String>) -> Result<()> {
    let links = Arc::new(WebRtcLinkFactory::new(cfg.ice_servers.clone()));
    let media = Arc::new(StaticMediaSource::new(cfg.media));
    let Client {
        handle,
        mut events,
        task,
    } = Client::connect(&cfg, links, media)?;
    let calling = target.clone();

    let mut failure = None;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logging::info("interrupt received, shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        report(&event);
        match event {
            CallEvent::StatusChanged(ChannelStatus::Open) => {
                if let Err(err) = handle.register(&cfg.identity).await {
                    logging::error(format!("register: {err}"));
                }
            }
            CallEvent::Registered { .. } => {
                if let Some(remote) = target.take() {
                    if let Err(err) = handle.call(&remote).await {
                        failure = Some(format!("call {remote}: {err}"));
                        break;
                    }
                }
            }
            CallEvent::RegistrationFailed(err) => {
                failure = Some(err.to_string());
                break;
            }
            CallEvent::Closed { remote } | CallEvent::CallFailed { remote, .. }
                if calling.as_deref() == Some(remote.as_str()) =>
            {
                break;
            }
            _ => {}
        }
    }

    handle.shutdown().await;
    let _ = task.await;
    match failure {
        Some(msg) => bail!(msg),
        None => Ok(()),
    }
}

fn report(event: &CallEvent) {
    match event {
        CallEvent::StatusChanged(status) => logging::info(format!("relay {status:?}")),
        CallEvent::Registered { identity } => logging::info(format!("registered as {identity}")),
        CallEvent::RegistrationFailed(err) => logging::error(format!("registration failed: {err}")),
        CallEvent::IncomingCall { from } => logging::info(format!("incoming call from {from}")),
        CallEvent::Connected { remote } => logging::info(format!("connected to {remote}")),
        CallEvent::RemoteTrack { remote, track } => logging::info(format!(
            "remote {} track from {remote} id={}",
            track.kind, track.id
        )),
        CallEvent::Closed { remote } => logging::info(format!("call with {remote} closed")),
        CallEvent::CallFailed { remote, reason } => {
            logging::error(format!("call with {remote} failed: {reason}"))
        }
        CallEvent::RelayError { code, message } => {
            logging::warn(format!("relay error {code}: {message}"))
        }
    }
}
