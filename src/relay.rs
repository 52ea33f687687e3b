use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::config::ReconnectConfig;
use crate::errors::CallError;
use crate::logging;
use crate::relayproto::{decode_binary, decode_text, Decoded, RelayMessage};

/// How long `disconnect` lets the loop close the socket before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Open,
    Closed,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Message(RelayMessage),
    StatusChanged(ChannelStatus),
}

/// The one place outbound relay frames go through.
pub trait RelaySink: Send + Sync {
    fn send(&self, msg: &RelayMessage) -> Result<(), CallError>;
}

/// Bounded exponential backoff: initial, 2x initial, 4x initial, ... capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    initial: Duration,
    max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self::new(cfg.initial(), cfg.max())
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map(|d| d.min(self.max))
            .unwrap_or(self.max)
    }
}

struct Shared {
    status: ChannelStatus,
    writer: Option<mpsc::UnboundedSender<String>>,
}

/// Reconnecting websocket to the rendezvous server.
///
/// Received frames and status changes are pushed to the event channel given
/// to `connect`. Reconnects never touch session state; consumers only see
/// `StatusChanged`.
pub struct RelayChannel {
    url: Url,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<Shared>>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayChannel {
    pub fn new(url: Url, policy: ReconnectPolicy) -> Self {
        Self {
            url,
            policy,
            shared: Arc::new(Mutex::new(Shared {
                status: ChannelStatus::Closed,
                writer: None,
            })),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared
            .lock()
            .map(|s| s.status)
            .unwrap_or(ChannelStatus::Closed)
    }

    /// Starts the connect/reconnect loop. Calling it while running is a no-op.
    pub fn connect(&self, events: mpsc::UnboundedSender<RelayEvent>) {
        let Ok(mut task) = self.task.lock() else {
            return;
        };
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let url = self.url.clone();
        let policy = self.policy;
        let shared = self.shared.clone();
        let shutdown = self.shutdown.clone();
        *task = Some(tokio::spawn(async move {
            run_relay_loop(url, policy, shared, shutdown, events).await;
        }));
    }

    /// Closes the socket and cancels any pending reconnect timer. The loop
    /// reports `StatusChanged(Closed)` itself unless it misses the grace
    /// period and has to be aborted.
    pub async fn disconnect(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(mut task) = task {
            // A stored permit also stops a loop that is mid-dial.
            self.shutdown.notify_one();
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                logging::warn("relay loop did not stop in time, aborting");
                task.abort();
            }
        }
        if let Ok(mut shared) = self.shared.lock() {
            shared.writer = None;
            shared.status = ChannelStatus::Closed;
        }
        logging::info("relay disconnected");
    }
}

impl RelaySink for RelayChannel {
    fn send(&self, msg: &RelayMessage) -> Result<(), CallError> {
        let text = msg.to_text().map_err(|err| {
            logging::error(format!("encode relay message: {err}"));
            CallError::ChannelNotOpen
        })?;
        let shared = self.shared.lock().map_err(|_| CallError::ChannelNotOpen)?;
        match (&shared.status, &shared.writer) {
            (ChannelStatus::Open, Some(writer)) => writer
                .send(text)
                .map_err(|_| CallError::ChannelNotOpen),
            _ => Err(CallError::ChannelNotOpen),
        }
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(t) = task.take() {
                t.abort();
            }
        }
    }
}

fn set_status(
    shared: &Mutex<Shared>,
    events: &mpsc::UnboundedSender<RelayEvent>,
    status: ChannelStatus,
    writer: Option<mpsc::UnboundedSender<String>>,
) {
    let changed = match shared.lock() {
        Ok(mut s) => {
            s.writer = writer;
            let changed = s.status != status;
            s.status = status;
            changed
        }
        Err(_) => false,
    };
    if changed {
        logging::info_kv("relay status", &[("status", &format!("{status:?}"))]);
        let _ = events.send(RelayEvent::StatusChanged(status));
    }
}

async fn run_relay_loop(
    url: Url,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<Shared>>,
    shutdown: Arc<Notify>,
    events: mpsc::UnboundedSender<RelayEvent>,
) {
    let mut attempt: u32 = 0;
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                attempt = 0;
                let (mut write, mut read) = ws_stream.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                set_status(&shared, &events, ChannelStatus::Open, Some(tx));

                let stop = loop {
                    tokio::select! {
                        _ = shutdown.notified() => break true,
                        out = rx.recv() => {
                            let Some(text) = out else { break false };
                            if let Err(err) = write.send(Message::Text(text)).await {
                                logging::error(format!("relay send error: {err}"));
                                break false;
                            }
                        }
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(txt))) => forward(&events, decode_text(&txt)),
                            Some(Ok(Message::Binary(bin))) => forward(&events, decode_binary(&bin)),
                            Some(Ok(Message::Close(_))) | None => break false,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                logging::error(format!("relay read error: {err}"));
                                break false;
                            }
                        },
                    }
                };
                // Later sends fail fast with ChannelNotOpen instead of vanishing.
                drop(rx);
                if stop {
                    let _ = write.close().await;
                    set_status(&shared, &events, ChannelStatus::Closed, None);
                    return;
                }
                logging::warn("relay connection lost");
            }
            Err(err) => {
                logging::warn(format!("relay connect failed url={url} err={err}"));
            }
        }

        set_status(&shared, &events, ChannelStatus::Reconnecting, None);
        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        logging::info_kv(
            "relay reconnect scheduled",
            &[
                ("attempt", &attempt.to_string()),
                ("delay_ms", &delay.as_millis().to_string()),
            ],
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.notified() => {
                set_status(&shared, &events, ChannelStatus::Closed, None);
                return;
            }
        }
    }
}

fn forward(events: &mpsc::UnboundedSender<RelayEvent>, decoded: anyhow::Result<Decoded>) {
    match decoded {
        Ok(Decoded::Message(msg)) => {
            let _ = events.send(RelayEvent::Message(msg));
        }
        Ok(Decoded::Unknown { typ }) => {
            logging::warn(format!("relay message with unknown type ignored: {typ}"));
        }
        Err(err) => logging::warn(format!("undecodable relay frame ignored: {err:#}")),
    }
}
