//! Keeps one backend connection alive until shutdown.
//!
//! [`Runner::run`] connects, heartbeats, logs inbound events, and on
//! disconnect either reconnects with backoff or reports why it stopped.

use std::time::Duration;

use gatelink_net::{
    ClientSession, ConnectError, Disconnect, DisconnectKind, GameClient, ServiceCategory,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::handlers::{HEARTBEAT, ServerEvent};
use crate::reconnect::{ReconnectConfig, ReconnectState};

/// Backend endpoint plus the services requested from it.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub categories: ServiceCategory,
}

/// Why [`Runner::run`] returned.
#[derive(Debug)]
pub enum Exit {
    /// Shutdown was requested.
    Shutdown,
    /// The connection dropped and reconnecting is disabled.
    Lost(Disconnect),
    /// The first connect failed and reconnecting is disabled.
    ConnectFailed(ConnectError),
    /// Every reconnection attempt failed.
    GaveUp { attempts: u32 },
}

/// Resolves once shutdown has been requested.
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Send `true` on the returned sender to request shutdown.
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    /// Wait for a shutdown request. Never resolves if the sender is dropped
    /// without requesting one.
    pub async fn requested(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

pub struct Runner<'a> {
    pub client: &'a GameClient,
    pub target: Target,
    /// Heartbeat period, `None` to disable.
    pub heartbeat: Option<Duration>,
    /// Backoff policy, `None` to give up on the first failure.
    pub reconnect: Option<ReconnectConfig>,
}

impl Runner<'_> {
    pub async fn run(
        &self,
        shutdown: &mut Shutdown,
        events: &mut mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Exit {
        let mut backoff = self.reconnect.clone().map(ReconnectState::new);
        let Target {
            host,
            port,
            categories,
        } = &self.target;

        loop {
            let attempt = tokio::select! {
                biased;
                _ = shutdown.requested() => return Exit::Shutdown,
                result = self.client.connect(host, *port, *categories) => result,
            };

            let stopped = match attempt {
                Ok(session) => {
                    info!("Connected to {} with {:?}", session.remote_addr(), categories);
                    if let Some(backoff) = backoff.as_mut() {
                        backoff.reset();
                    }
                    let Some(disconnect) = self.drive(session, shutdown, events).await else {
                        return Exit::Shutdown;
                    };
                    warn!("Connection lost ({}): {}", disconnect.kind, disconnect.message);
                    Exit::Lost(disconnect)
                }
                Err(err) => {
                    warn!("Connecting to {host}:{port} failed: {err}");
                    Exit::ConnectFailed(err)
                }
            };

            let Some(state) = backoff.as_mut() else {
                return stopped;
            };
            let Some(delay) = state.next_delay() else {
                return Exit::GaveUp {
                    attempts: state.attempts(),
                };
            };
            info!("Reconnection attempt {} in {:?}", state.attempts(), delay);
            tokio::select! {
                biased;
                _ = shutdown.requested() => return Exit::Shutdown,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Serve one session. Returns `None` on shutdown.
    async fn drive(
        &self,
        mut session: ClientSession,
        shutdown: &mut Shutdown,
        events: &mut mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Option<Disconnect> {
        let mut heartbeat = self.heartbeat.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut seq: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.requested() => {
                    self.client.disconnect(session.remote_addr()).await;
                    return None;
                }
                result = &mut session.disconnected => {
                    return Some(result.unwrap_or_else(|_| Disconnect {
                        kind: DisconnectKind::Cancel,
                        message: "connection dropped without notification".to_string(),
                    }));
                }
                Some(event) = events.recv() => log_event(event),
                _ = tick(&mut heartbeat) => {
                    seq = seq.wrapping_add(1);
                    if let Err(err) = session.send(HEARTBEAT, &seq.to_be_bytes()) {
                        warn!("Heartbeat {seq} not sent: {err}");
                    }
                }
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_event(event: ServerEvent) {
    match event {
        ServerEvent::HeartbeatAck(seq) => debug!("Heartbeat {seq} acknowledged"),
        ServerEvent::Notice(text) => info!("Server notice: {text}"),
        ServerEvent::LoginResult { accepted: true } => info!("Login accepted"),
        ServerEvent::LoginResult { accepted: false } => warn!("Login rejected"),
        ServerEvent::WorldState { len } => debug!("World state ({len} bytes)"),
        ServerEvent::CheatAck => info!("Debug command acknowledged"),
    }
}
