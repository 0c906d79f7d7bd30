//! Async session driver
//!
//! One task owns the session core and serializes every touch point: link
//! reads, tunnel reads, timer ticks and owner commands all land here, so
//! the state machine itself needs no locking. Events flow out over an
//! unbounded channel; commands flow in over a bounded one.

use std::time::{Duration, Instant};

use ovpn_protocol::transport::{LinkTransport, TunTransport};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::event::SessionEvent;
use crate::session::{Output, Session};

/// Timer granularity for retransmission, keep-alive and liveness checks
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Commands the owner can send to a running session
pub enum SessionCommand {
    /// Final stop
    Shutdown,
    /// Recoverable stop; the owner intends to re-establish
    Reconnect,
    /// Swap the link after a network change (needs a pushed peer id)
    RebindLink(Box<dyn LinkTransport>),
}

/// What woke the driver loop
enum Wake {
    Link(ovpn_protocol::Result<Vec<Vec<u8>>>),
    Tunnel(ovpn_protocol::Result<Vec<Vec<u8>>>),
    Tick,
    Command(Option<SessionCommand>),
}

/// Drives a [`Session`] over concrete transports
pub struct SessionRunner {
    session: Session,
    link: Box<dyn LinkTransport>,
    tunnel: Box<dyn TunTransport>,
    commands: mpsc::Receiver<SessionCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRunner {
    /// Wire a session to its transports. Returns the runner plus the
    /// command and event endpoints for the owner.
    pub fn new(
        session: Session,
        link: Box<dyn LinkTransport>,
        tunnel: Box<dyn TunTransport>,
    ) -> (
        Self,
        mpsc::Sender<SessionCommand>,
        mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                session,
                link,
                tunnel,
                commands: command_rx,
                events: event_tx,
            },
            command_tx,
            event_rx,
        )
    }

    /// Run until the session stops. Returns the stopping error, if any.
    pub async fn run(mut self) -> Result<()> {
        let out = self.session.start(
            self.link.remote_address(),
            self.link.mtu(),
            self.link.is_reliable(),
            Instant::now(),
        );
        self.apply(out).await;

        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.session.is_stopped() {
            // Resolve the wakeup first so the select arms release their
            // borrows before the session is touched
            let wake = tokio::select! {
                result = self.link.recv() => Wake::Link(result),
                result = self.tunnel.recv() => Wake::Tunnel(result),
                _ = ticker.tick() => Wake::Tick,
                command = self.commands.recv() => Wake::Command(command),
            };
            match wake {
                Wake::Link(Ok(packets)) => {
                    let out = self.session.received_link_packets(&packets, Instant::now());
                    self.apply(out).await;
                }
                Wake::Link(Err(e)) => {
                    let out = self.session.link_failed(&e.to_string());
                    self.apply(out).await;
                }
                Wake::Tunnel(Ok(packets)) => {
                    let out = self.session.send_tunnel_packets(&packets, Instant::now());
                    self.apply(out).await;
                }
                Wake::Tunnel(Err(e)) => {
                    log::warn!("tunnel closed: {}", e);
                    let out = self.session.shutdown();
                    self.apply(out).await;
                }
                Wake::Tick => {
                    let out = self.session.tick(Instant::now());
                    self.apply(out).await;
                }
                Wake::Command(command) => {
                    self.handle_command(command).await;
                }
            }
        }

        match self.session.last_error() {
            // The error itself was already delivered as a Stopped event;
            // surface a matching result to the caller of run()
            Some(error) => Err(Error::Transport(error.to_string())),
            None => Ok(()),
        }
    }

    async fn handle_command(&mut self, command: Option<SessionCommand>) {
        match command {
            Some(SessionCommand::Shutdown) | None => {
                let out = self.session.shutdown();
                self.apply(out).await;
            }
            Some(SessionCommand::Reconnect) => {
                let out = self.session.reconnect();
                self.apply(out).await;
            }
            Some(SessionCommand::RebindLink(new_link)) => {
                if self.session.rebind_link(
                    new_link.remote_address(),
                    new_link.mtu(),
                    new_link.is_reliable(),
                ) {
                    self.link = new_link;
                }
            }
        }
    }

    /// Write a batch of outputs to the transports and forward events.
    /// Completions arriving after the session stopped are ignored.
    async fn apply(&mut self, out: Output) {
        if !out.link.is_empty() {
            if let Err(e) = self.link.send(&out.link).await {
                if !self.session.is_stopped() {
                    let failed = self.session.link_failed(&e.to_string());
                    for event in failed.events {
                        let _ = self.events.send(event);
                    }
                }
            }
        }
        if !out.tunnel.is_empty() {
            if let Err(e) = self.tunnel.send(&out.tunnel).await {
                log::warn!("tunnel write failed: {}", e);
            }
        }
        for event in out.events {
            let _ = self.events.send(event);
        }
    }
}
