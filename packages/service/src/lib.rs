//! Sub-service multiplexing for the `GameBox` client.
//!
//! Once a session is live, every feature of the client (chat, lobby,
//! minigame, server status) shares the one line-oriented transport. The
//! [`ServiceBroker`] multiplexes that traffic: outbound requests get a
//! session-global sequence number and the owning service's name; inbound
//! `SERVICE` lines are demultiplexed purely by service name into that
//! service's payload stream. The unstructured remainder of each line is
//! interpreted by the individual sub-service grammars in [`chat`],
//! [`lobby`], [`minigame`] and [`status`].
//!
//! Protocol violations never crash the transport: they are funneled into a
//! single shared error stream of id-keyed [`ErrorNotice`]s, and at worst
//! stop the offending sub-service's own interpretation of the stream.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use gamebox_service::{ServiceBroker, chat::ChatService};
//! # use gamebox_session::Session;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = Session::new();
//! let broker = ServiceBroker::new(session);
//! broker.start();
//!
//! let chat = ChatService::start(&broker)?;
//! let mut events = chat.subscribe();
//!
//! chat.send_message("hello everyone").await?;
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod args;
pub mod chat;
pub mod lobby;
pub mod minigame;
pub mod status;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use gamebox_session::{ServiceLine, Session, SessionError, SessionState};
use gamebox_ws::CloseReason;
use thiserror::Error;
use tokio::select;
use tokio::sync::broadcast;

/// Errors returned synchronously from a sub-service send.
#[derive(Debug, Error)]
pub enum ServiceSendError {
    /// The session is not in a state this service may send from.
    #[error("Not registered")]
    NotRegistered,
    /// The underlying session rejected the line.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Protocol violations surfaced on the shared error stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// A second registration was attempted under an existing name.
    #[error("Service {0:?} is already registered")]
    DuplicateService(String),
    /// An inbound line addressed a service nobody registered.
    #[error("No service registered under {0:?}")]
    UnknownService(String),
    /// A `SERVICE` line did not match the event/response framing.
    #[error("Malformed service line: {0:?}")]
    MalformedFrame(String),
    /// A payload carried no command keyword at all.
    #[error("Missing command for service {service}")]
    MissingCommand { service: String },
    /// A command keyword outside the service's grammar.
    #[error("Bad command {keyword:?} for service {service}")]
    UnknownCommand { service: String, keyword: String },
    /// A token failed to parse as its schema type.
    #[error("Invalid {argument} for {service} {command}: {value:?}")]
    InvalidArgument {
        service: String,
        command: String,
        argument: &'static str,
        value: String,
    },
    /// A schema argument was absent.
    #[error("Missing {argument} for {service} {command}")]
    MissingArgument {
        service: String,
        command: String,
        argument: &'static str,
    },
    /// The transport failed underneath the session.
    #[error("Transport failed: {0}")]
    Transport(String),
}

/// One entry on the shared error stream, keyed by a locally generated
/// sequence id so display layers can track and expire notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorNotice {
    pub id: u64,
    pub error: ServiceError,
}

/// A payload routed to one sub-service, still tagged with the session
/// epoch its line arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePayload {
    pub epoch: u64,
    pub body: String,
}

/// When a sub-service is allowed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceScope {
    /// May send as soon as a transport is bound (`Unregistered` onward).
    Connection,
    /// May send only while `Registered`.
    Room,
}

#[derive(Default)]
struct Channels {
    by_name: HashMap<String, broadcast::Sender<ServicePayload>>,
}

/// The sub-service multiplexer/demultiplexer.
///
/// Cheap to clone; clones share the same routing state. One broker serves
/// every session lifetime of its [`Session`]: the sequence counter and the
/// pending-request ledger reset each time the session disconnects.
#[derive(Clone)]
pub struct ServiceBroker {
    session: Session,
    seq: Arc<AtomicU64>,
    pending: Arc<Mutex<HashMap<u64, String>>>,
    channels: Arc<Mutex<Channels>>,
    errors_tx: broadcast::Sender<ErrorNotice>,
    error_seq: Arc<AtomicU64>,
    synced_epoch: Arc<AtomicU64>,
}

impl ServiceBroker {
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            session,
            seq: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            channels: Arc::new(Mutex::new(Channels::default())),
            errors_tx: broadcast::channel(64).0,
            error_seq: Arc::new(AtomicU64::new(0)),
            synced_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The session this broker multiplexes over.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Spawns the routing loop. Call once, before the first inbound line is
    /// expected.
    pub fn start(&self) {
        let mut lines = self.session.subscribe_service_lines();
        let mut state = self.session.subscribe_state();
        let mut closures = self.session.subscribe_closures();
        let broker = self.clone();

        tokio::spawn(async move {
            #[allow(clippy::redundant_pub_crate)]
            loop {
                select!(
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *state.borrow_and_update() == SessionState::Disconnected {
                            broker.reset();
                        }
                    }
                    closure = closures.recv() => {
                        if let Ok(CloseReason::Error(detail)) = closure {
                            broker.publish_error(ServiceError::Transport(detail));
                        }
                    }
                    line = lines.recv() => match line {
                        Ok(line) => broker.route_line(&line),
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            log::warn!("Service router lagged by {count} lines");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                );
            }
            log::debug!("Service router stopped");
        });
    }

    /// Registers a sub-service under a unique name.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceError::DuplicateService`] if the name is taken
    ///
    /// # Panics
    ///
    /// * Panics if the internal `Mutex` is poisoned
    pub fn register(&self, name: &str, scope: ServiceScope) -> Result<ServiceHandle, ServiceError> {
        let mut channels = self.channels.lock().unwrap();
        if channels.by_name.contains_key(name) {
            return Err(ServiceError::DuplicateService(name.to_string()));
        }
        let payloads_tx = broadcast::channel(64).0;
        channels
            .by_name
            .insert(name.to_string(), payloads_tx.clone());
        drop(channels);

        log::debug!("Registered sub-service {name}");

        Ok(ServiceHandle {
            name: name.to_string(),
            scope,
            broker: self.clone(),
            payloads_tx,
        })
    }

    /// Subscribes to the shared stream of protocol-error notices.
    #[must_use]
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorNotice> {
        self.errors_tx.subscribe()
    }

    /// Publishes a protocol error to every error subscriber, assigning it
    /// the next notice id.
    pub fn publish_error(&self, error: ServiceError) {
        let id = self.error_seq.fetch_add(1, Ordering::SeqCst);
        log::error!("Service protocol error (notice {id}): {error}");
        let _ = self.errors_tx.send(ErrorNotice { id, error });
    }

    fn route_line(&self, service_line: &ServiceLine) {
        self.sync_session_epoch();
        if let Err(e) = self.try_route(service_line) {
            self.publish_error(e);
        }
    }

    /// Rebases the sequence counter and pending ledger onto the current
    /// session lifetime. Requests are numbered from 0 within every
    /// session, independent of service.
    fn sync_session_epoch(&self) {
        let current = self.session.epoch();
        if self.synced_epoch.swap(current, Ordering::SeqCst) != current {
            self.reset();
        }
    }

    fn try_route(&self, service_line: &ServiceLine) -> Result<(), ServiceError> {
        let line = service_line.line.as_str();
        let malformed = || ServiceError::MalformedFrame(line.to_string());

        let rest = line.strip_prefix("SERVICE ").ok_or_else(malformed)?;
        let (kind, rest) = rest.split_once(' ').ok_or_else(malformed)?;
        match kind {
            "EVENT" => {
                let (name, payload) = rest
                    .split_once(' ')
                    .map_or((rest, ""), |(name, payload)| (name, payload));
                self.dispatch(name, payload, service_line.epoch)
            }
            "RESPONSE" => {
                let (seq, rest) = rest.split_once(' ').ok_or_else(malformed)?;
                let seq: u64 = seq.parse().map_err(|_| malformed())?;
                let (name, payload) = rest
                    .split_once(' ')
                    .map_or((rest, ""), |(name, payload)| (name, payload));
                self.retire(seq, name);
                self.dispatch(name, payload, service_line.epoch)
            }
            _ => Err(malformed()),
        }
    }

    fn dispatch(&self, name: &str, payload: &str, epoch: u64) -> Result<(), ServiceError> {
        let channels = self.channels.lock().unwrap();
        let Some(payloads_tx) = channels.by_name.get(name) else {
            return Err(ServiceError::UnknownService(name.to_string()));
        };
        log::trace!("Routing payload to {name}: {payload}");
        let _ = payloads_tx.send(ServicePayload {
            epoch,
            body: payload.to_string(),
        });
        Ok(())
    }

    fn retire(&self, seq: u64, name: &str) {
        match self.pending.lock().unwrap().remove(&seq) {
            Some(expected) if expected == name => {}
            Some(expected) => {
                log::warn!("Response {seq} answered {expected} but was addressed to {name}");
            }
            None => log::debug!("Response {seq} matches no pending request"),
        }
    }

    fn reset(&self) {
        let abandoned = {
            let mut pending = self.pending.lock().unwrap();
            let count = pending.len();
            pending.clear();
            count
        };
        if abandoned > 0 {
            log::debug!("Session ended, abandoning {abandoned} pending requests");
        }
        self.seq.store(0, Ordering::SeqCst);
    }
}

/// A sub-service's registration with the broker: its inbound payload
/// stream and its numbered outbound request path.
#[derive(Clone)]
pub struct ServiceHandle {
    name: String,
    scope: ServiceScope,
    broker: ServiceBroker,
    payloads_tx: broadcast::Sender<ServicePayload>,
}

impl ServiceHandle {
    /// Subscribes to the raw payloads routed to this service.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServicePayload> {
        self.payloads_tx.subscribe()
    }

    /// Sends a request payload, tagged with the next session-global
    /// sequence number and this service's name. Returns the number used.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceSendError::NotRegistered`] if the session state
    ///   does not admit this service's scope
    /// * Returns [`ServiceSendError::Session`] if the transport rejects
    ///   the line
    ///
    /// # Panics
    ///
    /// * Panics if the internal `Mutex` is poisoned
    pub async fn request(&self, body: &str) -> Result<u64, ServiceSendError> {
        match (self.broker.session.state(), self.scope) {
            (SessionState::Registered, _) | (SessionState::Unregistered, ServiceScope::Connection) => {}
            _ => return Err(ServiceSendError::NotRegistered),
        }

        self.broker.sync_session_epoch();
        let seq = self.broker.seq.fetch_add(1, Ordering::SeqCst);
        self.broker
            .pending
            .lock()
            .unwrap()
            .insert(seq, self.name.clone());

        let line = format!("SERVICE REQUEST {seq} {} {body}", self.name);
        if let Err(e) = self.broker.session.send_line(&line).await {
            self.broker.pending.lock().unwrap().remove(&seq);
            return Err(e.into());
        }
        Ok(seq)
    }

    /// Publishes a protocol error for this service on the shared stream.
    pub fn publish_error(&self, error: ServiceError) {
        self.broker.publish_error(error);
    }
}

/// Runs a typed sub-service's parse loop: raw payloads in, typed events
/// out. A parse failure is fatal to this service's interpretation of the
/// stream, but only to this service's. Payloads carried over from an
/// earlier session lifetime are dropped rather than delivered late.
pub(crate) fn spawn_event_loop<T: Clone + Send + 'static>(
    handle: &ServiceHandle,
    events_tx: broadcast::Sender<T>,
    parse: fn(&str) -> Result<T, ServiceError>,
) {
    let mut payloads = handle.subscribe();
    let handle = handle.clone();

    tokio::spawn(async move {
        loop {
            match payloads.recv().await {
                Ok(payload) => {
                    if payload.epoch != handle.broker.session.epoch() {
                        log::trace!(
                            "Dropping stale {} payload from session {}",
                            handle.name,
                            payload.epoch
                        );
                        continue;
                    }
                    match parse(&payload.body) {
                        Ok(event) => {
                            let _ = events_tx.send(event);
                        }
                        Err(e) => {
                            handle.publish_error(e);
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    log::warn!("{} event loop lagged by {count} payloads", handle.name);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        log::debug!("{} event loop stopped", handle.name);
    });
}

#[cfg(test)]
mod tests {
    use gamebox_ws::Transport;
    use pretty_assertions::assert_eq;

    use crate::chat::ChatService;
    use crate::lobby::{LobbyEvent, LobbyService};
    use crate::status::StatusService;

    use super::*;

    async fn registered_broker() -> (ServiceBroker, gamebox_ws::TransportDriver) {
        let session = Session::new();
        let broker = ServiceBroker::new(session.clone());
        broker.start();

        let (transport, mut driver) = Transport::pair();
        session.begin_session(transport).await.unwrap();
        session.register(7, "alice").await.unwrap();
        assert_eq!(driver.recv_line().await.unwrap(), "LOGIN 7 alice");
        driver.push_line("REGISTRATION 7 alice");
        session
            .subscribe_state()
            .wait_for(|s| *s == SessionState::Registered)
            .await
            .unwrap();

        (broker, driver)
    }

    #[test_log::test(tokio::test)]
    async fn test_sequence_numbers_are_global_and_start_at_zero() {
        let (broker, mut driver) = registered_broker().await;
        let chat = ChatService::start(&broker).unwrap();
        let lobby = LobbyService::start(&broker).unwrap();

        chat.send_message("hi").await.unwrap();
        lobby.ready().await.unwrap();
        chat.send_message("still here").await.unwrap();

        assert_eq!(driver.recv_line().await.unwrap(), "SERVICE REQUEST 0 Chat MESSAGE hi");
        assert_eq!(driver.recv_line().await.unwrap(), "SERVICE REQUEST 1 Lobby READY");
        assert_eq!(
            driver.recv_line().await.unwrap(),
            "SERVICE REQUEST 2 Chat MESSAGE still here"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_sequence_numbers_reset_per_session() {
        let (broker, mut driver) = registered_broker().await;
        let chat = ChatService::start(&broker).unwrap();

        chat.send_message("first session").await.unwrap();
        driver.recv_line().await.unwrap();

        let session = broker.session().clone();
        session.end_session().await;
        let mut state = session.subscribe_state();
        state
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();

        let (transport, mut driver) = Transport::pair();
        session.begin_session(transport).await.unwrap();
        session.register(7, "alice").await.unwrap();
        assert_eq!(driver.recv_line().await.unwrap(), "LOGIN 7 alice");
        driver.push_line("REGISTRATION 7 alice");
        state
            .wait_for(|s| *s == SessionState::Registered)
            .await
            .unwrap();

        chat.send_message("second session").await.unwrap();
        assert_eq!(
            driver.recv_line().await.unwrap(),
            "SERVICE REQUEST 0 Chat MESSAGE second session"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_room_services_cannot_send_before_registration() {
        let session = Session::new();
        let broker = ServiceBroker::new(session.clone());
        broker.start();
        let chat = ChatService::start(&broker).unwrap();
        let status = StatusService::start(&broker).unwrap();

        let (transport, mut driver) = Transport::pair();
        session.begin_session(transport).await.unwrap();

        // Unregistered: room traffic is rejected, the status probe is not.
        assert!(matches!(
            chat.send_message("too early").await,
            Err(ServiceSendError::NotRegistered)
        ));
        status.checkout().await.unwrap();
        assert_eq!(
            driver.recv_line().await.unwrap(),
            "SERVICE REQUEST 0 Status CHECKOUT"
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_no_service_can_send_while_disconnected() {
        let session = Session::new();
        let broker = ServiceBroker::new(session);
        broker.start();
        let status = StatusService::start(&broker).unwrap();

        assert!(matches!(
            status.checkout().await,
            Err(ServiceSendError::NotRegistered)
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_routing_is_by_service_name() {
        let (broker, driver) = registered_broker().await;
        let chat = ChatService::start(&broker).unwrap();
        let lobby = LobbyService::start(&broker).unwrap();
        let mut chat_events = chat.subscribe();
        let mut lobby_events = lobby.subscribe();

        driver.push_line("SERVICE EVENT Lobby READY_PLAYER 3");
        driver.push_line("SERVICE EVENT Chat MESSAGE_FROM 3 good luck");

        assert_eq!(
            lobby_events.recv().await.unwrap(),
            LobbyEvent::ReadyPlayer(3)
        );
        assert_eq!(
            chat_events.recv().await.unwrap(),
            crate::chat::ChatEvent::MessageFrom {
                author: 3,
                text: "good luck".to_string()
            }
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_command_errors_one_service_only() {
        let (broker, driver) = registered_broker().await;
        let chat = ChatService::start(&broker).unwrap();
        let lobby = LobbyService::start(&broker).unwrap();
        let mut errors = broker.subscribe_errors();
        let mut lobby_events = lobby.subscribe();
        let _chat_events = chat.subscribe();

        driver.push_line("SERVICE EVENT Chat FOO");

        let notice = errors.recv().await.unwrap();
        assert_eq!(
            notice.error,
            ServiceError::UnknownCommand {
                service: "Chat".to_string(),
                keyword: "FOO".to_string(),
            }
        );

        // The transport and sibling services keep working.
        driver.push_line("SERVICE EVENT Lobby PLAYING");
        assert_eq!(lobby_events.recv().await.unwrap(), LobbyEvent::Playing);
        assert_eq!(broker.session().state(), SessionState::Registered);
    }

    #[test_log::test(tokio::test)]
    async fn test_error_notices_carry_increasing_ids() {
        let (broker, driver) = registered_broker().await;
        let mut errors = broker.subscribe_errors();

        driver.push_line("SERVICE EVENT Nowhere PING");
        driver.push_line("SERVICE EVENT NowhereElse PING");

        let first = errors.recv().await.unwrap();
        let second = errors.recv().await.unwrap();
        assert_eq!(
            first.error,
            ServiceError::UnknownService("Nowhere".to_string())
        );
        assert!(second.id > first.id);
    }

    #[test_log::test(tokio::test)]
    async fn test_malformed_service_frame_is_reported() {
        let (broker, driver) = registered_broker().await;
        let mut errors = broker.subscribe_errors();

        driver.push_line("SERVICE NONSENSE Chat hi");

        assert_eq!(
            errors.recv().await.unwrap().error,
            ServiceError::MalformedFrame("SERVICE NONSENSE Chat hi".to_string())
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_response_framing_routes_and_retires() {
        let (broker, mut driver) = registered_broker().await;
        let status = StatusService::start(&broker).unwrap();
        let mut events = status.subscribe();

        let seq = status.checkout().await.unwrap();
        assert_eq!(
            driver.recv_line().await.unwrap(),
            format!("SERVICE REQUEST {seq} Status CHECKOUT")
        );

        driver.push_line(&format!("SERVICE RESPONSE {seq} Status AVAILABILITY 1 2"));

        assert_eq!(
            events.recv().await.unwrap(),
            crate::status::StatusEvent::Availability {
                current: 1,
                capacity: 2
            }
        );
        assert!(broker.pending.lock().unwrap().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_duplicate_registration_is_rejected() {
        let session = Session::new();
        let broker = ServiceBroker::new(session);

        broker.register("Chat", ServiceScope::Room).unwrap();
        assert!(matches!(
            broker.register("Chat", ServiceScope::Room),
            Err(ServiceError::DuplicateService(name)) if name == "Chat"
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_transport_failure_reaches_error_stream() {
        let (broker, driver) = registered_broker().await;
        let mut errors = broker.subscribe_errors();

        driver.close(gamebox_ws::CloseReason::Error("connection reset".to_string()));

        assert_eq!(
            errors.recv().await.unwrap().error,
            ServiceError::Transport("connection reset".to_string())
        );
    }
}
