use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use crate::config::Config;
use crate::errors::CallError;
use crate::logging;
use crate::peerlink::{LinkEvent, MediaSource, PeerLinkFactory};
use crate::relay::{ReconnectPolicy, RelayChannel, RelayEvent, RelaySink};
use crate::router::{CallEvent, SignalingRouter};

type Reply = oneshot::Sender<Result<(), CallError>>;

enum Command {
    Register { identity: String, reply: Reply },
    Call { remote: String, reply: Reply },
    Hangup { remote: String, reply: Reply },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cheap, cloneable front door to a running client loop.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ClientHandle {
    async fn request(&self, make: impl FnOnce(Reply) -> Command) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| CallError::ClientStopped)?;
        rx.await.map_err(|_| CallError::ClientStopped)?
    }

    pub async fn register(&self, identity: &str) -> Result<(), CallError> {
        let identity = identity.to_string();
        self.request(|reply| Command::Register { identity, reply })
            .await
    }

    pub async fn call(&self, remote: &str) -> Result<(), CallError> {
        let remote = remote.to_string();
        self.request(|reply| Command::Call { remote, reply }).await
    }

    pub async fn hangup(&self, remote: &str) -> Result<(), CallError> {
        let remote = remote.to_string();
        self.request(|reply| Command::Hangup { remote, reply }).await
    }

    /// Hangs up every session and closes the relay. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

pub struct Client {
    pub handle: ClientHandle,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
    pub task: JoinHandle<()>,
}

impl Client {
    /// Opens the relay channel from `cfg` and starts the event loop.
    pub fn connect(
        cfg: &Config,
        links: Arc<dyn PeerLinkFactory>,
        media: Arc<dyn MediaSource>,
    ) -> Result<Self> {
        let url = Url::parse(&cfg.relay_url)
            .with_context(|| format!("invalid relay url {}", cfg.relay_url))?;
        let relay = Arc::new(RelayChannel::new(
            url,
            ReconnectPolicy::from_config(&cfg.reconnect),
        ));
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        relay.connect(relay_tx);
        let stopper = relay.clone();
        Ok(Self::spawn(
            relay,
            relay_rx,
            links,
            media,
            Box::pin(async move { stopper.disconnect().await }),
        ))
    }

    /// Starts the event loop over any relay transport. `on_stop` is awaited
    /// once after all sessions are released at shutdown.
    pub fn spawn(
        relay: Arc<dyn RelaySink>,
        relay_events: mpsc::UnboundedReceiver<RelayEvent>,
        links: Arc<dyn PeerLinkFactory>,
        media: Arc<dyn MediaSource>,
        on_stop: BoxFuture<'static, ()>,
    ) -> Self {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, cmd_rx) = mpsc::unbounded_channel();
        let router = SignalingRouter::new(relay, links, media, link_tx, events_tx);
        let task = tokio::spawn(run_loop(router, relay_events, link_rx, cmd_rx, on_stop));
        Self {
            handle: ClientHandle { commands },
            events,
            task,
        }
    }
}

async fn run_loop(
    mut router: SignalingRouter,
    mut relay_rx: mpsc::UnboundedReceiver<RelayEvent>,
    mut link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    on_stop: BoxFuture<'static, ()>,
) {
    logging::info("client loop started");
    let reply = loop {
        tokio::select! {
            Some(event) = relay_rx.recv() => router.handle_relay_event(event).await,
            Some(event) = link_rx.recv() => router.handle_link_event(event).await,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Shutdown { reply }) => break Some(reply),
                Some(cmd) => dispatch(&mut router, cmd).await,
                None => break None,
            },
        }
    };
    router.hangup_all().await;
    on_stop.await;
    logging::info("client loop stopped");
    if let Some(reply) = reply {
        let _ = reply.send(());
    }
}

async fn dispatch(router: &mut SignalingRouter, cmd: Command) {
    match cmd {
        Command::Register { identity, reply } => {
            let _ = reply.send(router.register(&identity));
        }
        Command::Call { remote, reply } => {
            let _ = reply.send(router.initiate_call(&remote).await);
        }
        Command::Hangup { remote, reply } => {
            let _ = reply.send(router.hangup(&remote).await);
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(());
        }
    }
}
