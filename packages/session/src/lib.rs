//! Session registration state machine for the `GameBox` client.
//!
//! A [`Session`] owns at most one live transport at a time and converts its
//! line stream into peer-identity state: who the local player is, who else
//! is present, and whether the session is `Disconnected`, `Unregistered`,
//! or `Registered`. Consumers observe state transitions through a hot
//! observable with initial-value semantics (a `watch` channel) and pull
//! peer-list snapshots on demand.
//!
//! # Features
//!
//! * Strictly ordered `Disconnected -> Unregistered -> Registered ->
//!   Disconnected` lifecycle with fail-fast usage errors
//! * Peer set owned exclusively by the session, exposed as point-in-time
//!   snapshots
//! * Verbatim forwarding of sub-service lines to the multiplexing layer
//! * Fatal teardown on malformed handshake lines
//!
//! # Examples
//!
//! ```rust,no_run
//! # use gamebox_session::{Session, SessionState};
//! # use gamebox_ws::Transport;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new();
//! let mut state = session.subscribe_state();
//!
//! let transport = Transport::connect("ws://localhost:35555/").await?;
//! session.begin_session(transport).await?;
//! session.register(1, "alice").await?;
//!
//! state
//!     .wait_for(|s| *s == SessionState::Registered)
//!     .await?;
//! println!("Registered as {:?}", session.self_identity().await);
//! # Ok(())
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod models;
mod protocol;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gamebox_ws::{CloseReason, Transport, TransportEvent, TransportHandle, TransportSendError};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast, mpsc, watch};

pub use crate::models::{Actor, SessionState};
pub use crate::protocol::ProtocolError;

use crate::protocol::ServerLine;

/// Error type for session usage-contract violations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `begin_session` was called while a session is already live.
    #[error("Already connected")]
    AlreadyConnected,
    /// An operation that needs a live transport was called without one.
    #[error("Not connected")]
    NotConnected,
    /// The transport rejected a send.
    #[error(transparent)]
    Send(#[from] TransportSendError),
}

/// A sub-service line forwarded verbatim, tagged with the session
/// lifetime it arrived in so late routing can never attribute it to a
/// newer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLine {
    pub epoch: u64,
    pub line: String,
}

/// The session registration state machine.
///
/// Cheap to clone; clones share the same state. The session is the sole
/// owner of the bound transport and of the peer set.
#[derive(Clone)]
pub struct Session {
    state_tx: Arc<watch::Sender<SessionState>>,
    transport: Arc<RwLock<Option<TransportHandle>>>,
    identity: Arc<RwLock<Option<Actor>>>,
    peers: Arc<RwLock<BTreeMap<u64, Actor>>>,
    peers_tx: broadcast::Sender<Vec<Actor>>,
    service_tx: broadcast::Sender<ServiceLine>,
    close_tx: broadcast::Sender<CloseReason>,
    epoch: Arc<AtomicU64>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);

        Self {
            state_tx: Arc::new(state_tx),
            transport: Arc::new(RwLock::new(None)),
            identity: Arc::new(RwLock::new(None)),
            peers: Arc::new(RwLock::new(BTreeMap::new())),
            peers_tx: broadcast::channel(64).0,
            service_tx: broadcast::channel(256).0,
            close_tx: broadcast::channel(16).0,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Monotonic count of session lifetimes; bumps on every successful
    /// [`Self::begin_session`]. Lets per-session consumers (request
    /// numbering, pending-request ledgers) detect a new lifetime without
    /// racing the state stream.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// The current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions. The receiver starts out holding the
    /// then-current state; past transitions are not replayed.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Subscribes to on-demand peer-list snapshots (see [`Self::publish_peers`]).
    #[must_use]
    pub fn subscribe_peers(&self) -> broadcast::Receiver<Vec<Actor>> {
        self.peers_tx.subscribe()
    }

    /// Subscribes to the raw sub-service lines the session forwards
    /// untouched, each tagged with its session epoch.
    #[must_use]
    pub fn subscribe_service_lines(&self) -> broadcast::Receiver<ServiceLine> {
        self.service_tx.subscribe()
    }

    /// Subscribes to transport close reasons, emitted once per session end.
    #[must_use]
    pub fn subscribe_closures(&self) -> broadcast::Receiver<CloseReason> {
        self.close_tx.subscribe()
    }

    /// The local player's identity, known only while `Registered`.
    pub async fn self_identity(&self) -> Option<Actor> {
        self.identity.read().await.clone()
    }

    /// A point-in-time snapshot of the peer set, ordered by uid.
    pub async fn peers(&self) -> Vec<Actor> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Raises the "update peer list" signal: broadcasts a fresh snapshot to
    /// every peer-list subscriber. Membership churn alone never emits;
    /// consumers decide when they want to pay for a refresh.
    pub async fn publish_peers(&self) {
        let snapshot = self.peers().await;
        let _ = self.peers_tx.send(snapshot);
    }

    /// Binds a transport and starts a new session lifetime.
    ///
    /// Resets the peer set, emits `Unregistered`, and spawns the inbound
    /// read loop.
    ///
    /// # Errors
    ///
    /// * Returns [`SessionError::AlreadyConnected`] if a session is live
    pub async fn begin_session(&self, transport: Transport) -> Result<(), SessionError> {
        let events = {
            let mut slot = self.transport.write().await;
            if *self.state_tx.borrow() != SessionState::Disconnected {
                return Err(SessionError::AlreadyConnected);
            }
            let (handle, events) = transport.split();
            slot.replace(handle);
            events
        };

        self.identity.write().await.take();
        self.peers.write().await.clear();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.state_tx.send_replace(SessionState::Unregistered);
        log::debug!("begin_session: transport bound");

        tokio::spawn({
            let session = self.clone();
            async move {
                session.read_loop(events).await;
            }
        });

        Ok(())
    }

    /// Sends the handshake request for the given identity. The state does
    /// not change until the server answers with a registration line.
    ///
    /// # Errors
    ///
    /// * Returns [`SessionError::NotConnected`] if the session is not
    ///   `Unregistered`
    /// * Returns [`SessionError::Send`] if the transport rejects the line
    pub async fn register(&self, uid: u64, name: &str) -> Result<(), SessionError> {
        if self.state() != SessionState::Unregistered {
            return Err(SessionError::NotConnected);
        }
        self.send_line(&protocol::login_line(uid, name)).await
    }

    /// Sends a raw protocol line over the bound transport.
    ///
    /// # Errors
    ///
    /// * Returns [`SessionError::NotConnected`] if no transport is bound
    /// * Returns [`SessionError::Send`] if the transport rejects the line
    pub async fn send_line(&self, line: &str) -> Result<(), SessionError> {
        let transport = self.transport.read().await.clone();
        transport.ok_or(SessionError::NotConnected)?.send(line)?;
        Ok(())
    }

    /// Initiates graceful shutdown of the bound transport, if any. The
    /// final `Disconnected` state is reached asynchronously once the
    /// transport confirms closure.
    pub async fn end_session(&self) {
        let transport = self.transport.read().await.clone();
        if let Some(handle) = transport {
            log::debug!("end_session: closing transport");
            handle.close();
        }
    }

    async fn read_loop(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Line(line) => {
                    if let Err(e) = self.handle_line(&line).await {
                        log::error!("Fatal protocol error, tearing session down: {e}");
                        self.disconnect(Some(CloseReason::Error(e.to_string())))
                            .await;
                        break;
                    }
                }
                TransportEvent::Closed(reason) => {
                    log::debug!("Transport closed: {reason:?}");
                    self.disconnect(Some(reason)).await;
                    break;
                }
            }
        }
        log::debug!("Exiting session read loop");
    }

    async fn handle_line(&self, line: &str) -> Result<(), ProtocolError> {
        match protocol::parse_line(line)? {
            ServerLine::Registration(actors) => {
                if self.state() != SessionState::Unregistered {
                    log::warn!("Ignoring registration line outside handshake");
                    return Ok(());
                }
                // Self comes first; the peer set is self plus everyone
                // already connected.
                self.identity.write().await.replace(actors[0].clone());
                let mut peers = self.peers.write().await;
                for actor in actors {
                    peers.insert(actor.uid, actor);
                }
                drop(peers);
                self.state_tx.send_replace(SessionState::Registered);
                log::debug!("Registration complete");
            }
            ServerLine::LoggedIn(actor) => {
                log::debug!("Peer joined: {} ({})", actor.name, actor.uid);
                self.peers.write().await.insert(actor.uid, actor);
            }
            ServerLine::LoggedOut(uid) => {
                if self.peers.write().await.remove(&uid).is_none() {
                    log::debug!("Ignoring departure of unknown peer {uid}");
                }
            }
            ServerLine::Interrupt => {
                log::info!("Server announced shutdown, closing transport");
                self.end_session().await;
            }
            ServerLine::Service(raw) => {
                let _ = self.service_tx.send(ServiceLine {
                    epoch: self.epoch(),
                    line: raw,
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&self, reason: Option<CloseReason>) {
        {
            let mut slot = self.transport.write().await;
            if let Some(handle) = slot.take() {
                handle.close();
            }
        }
        self.identity.write().await.take();
        self.peers.write().await.clear();
        self.state_tx.send_replace(SessionState::Disconnected);
        if let Some(reason) = reason {
            let _ = self.close_tx.send(reason);
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
