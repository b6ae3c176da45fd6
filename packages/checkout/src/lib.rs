//! Servers-list status scan for the `GameBox` client.
//!
//! The [`StatusScanner`] walks the roster of known game servers strictly in
//! order and, for each one, runs a short-lived session: connect, wait for
//! the transport to come up, issue a status checkout, and race the answer
//! against a timeout. Whatever the outcome, the session is torn down and
//! its closure confirmed before the next server is touched, so the one
//! shared [`Session`] never has two live transports.
//!
//! Absence of an answer (timeout, refusal, disconnection mid-status) is a
//! normal outcome, not an error: the snapshot for that server simply has no
//! [`Availability`]. A scan therefore always completes, even when every
//! server is unreachable.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use gamebox_checkout::StatusScanner;
//! # use gamebox_config::{Origin, known_servers};
//! # use gamebox_service::ServiceBroker;
//! # use gamebox_session::Session;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = ServiceBroker::new(Session::new());
//! broker.start();
//!
//! let scanner = StatusScanner::new(
//!     &broker,
//!     Origin::new("http", "play.example.com"),
//!     known_servers().to_vec(),
//! )?;
//!
//! for status in scanner.scan().await? {
//!     match status.availability {
//!         Some(a) => println!("{}: {}/{}", status.name, a.current, a.capacity),
//!         None => println!("{}: unreachable", status.name),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use gamebox_config::{ConfigError, GameKind, Origin, ServerDescriptor};
use gamebox_service::status::{StatusEvent, StatusService};
use gamebox_service::{ServiceBroker, ServiceError};
use gamebox_session::{Session, SessionState};
use gamebox_ws::{ConnectError, Transport};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

const CHECKOUT_TIMEOUT: Duration = Duration::from_millis(5000);

/// How long a step waits for a status answer before giving up. Pluggable
/// so tests can drive the timeout deterministically.
pub type DelayStrategy = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Opens the transport for one step. Pluggable so tests can hand the
/// scanner in-memory transports.
pub type TransportFactory =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Transport, ConnectError>> + Send + Sync>;

/// Error type for scan usage-contract violations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// A scan is already in progress; only one may run at a time.
    #[error("A scan is already in progress")]
    Busy,
    /// The page origin cannot be resolved to a `WebSocket` endpoint.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The status sub-service could not be registered.
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// A server's live occupancy, when a checkout round-trip succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub current: u32,
    pub capacity: u32,
}

/// One server's entry in a completed scan, in roster order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub kind: GameKind,
    /// `None` when no status answer arrived in time; an expected outcome,
    /// not an error.
    pub availability: Option<Availability>,
}

/// The sequential servers-list scanner.
///
/// Holds the one shared [`Session`] for the duration of a scan; the
/// `Busy` gate keeps any second writer away from it while a scan runs.
pub struct StatusScanner {
    session: Session,
    status: StatusService,
    origin: Origin,
    servers: Vec<ServerDescriptor>,
    connect: TransportFactory,
    delay: DelayStrategy,
    scanning: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    results_tx: broadcast::Sender<Vec<ServerStatus>>,
}

impl StatusScanner {
    /// Creates a scanner over the given roster, validating the origin up
    /// front.
    ///
    /// # Errors
    ///
    /// * Returns [`CheckoutError::Config`] if the origin scheme has no
    ///   `WebSocket` counterpart
    /// * Returns [`CheckoutError::Service`] if the status sub-service is
    ///   already registered
    pub fn new(
        broker: &ServiceBroker,
        origin: Origin,
        servers: Vec<ServerDescriptor>,
    ) -> Result<Self, CheckoutError> {
        origin.ws_scheme()?;
        let status = StatusService::start(broker)?;

        Ok(Self {
            session: broker.session().clone(),
            status,
            origin,
            servers,
            connect: Arc::new(|url: String| -> BoxFuture<'static, Result<Transport, ConnectError>> {
                Box::pin(async move { Transport::connect(&url).await })
            }),
            delay: Arc::new(|| -> BoxFuture<'static, ()> {
                Box::pin(tokio::time::sleep(CHECKOUT_TIMEOUT))
            }),
            scanning: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            results_tx: broadcast::channel(16).0,
        })
    }

    /// Replaces the transport factory.
    #[must_use]
    pub fn with_connector(mut self, connect: TransportFactory) -> Self {
        self.connect = connect;
        self
    }

    /// Replaces the timeout strategy.
    #[must_use]
    pub fn with_delay(mut self, delay: DelayStrategy) -> Self {
        self.delay = delay;
        self
    }

    /// Subscribes to completed scan snapshots.
    #[must_use]
    pub fn subscribe_results(&self) -> broadcast::Receiver<Vec<ServerStatus>> {
        self.results_tx.subscribe()
    }

    /// Runs one full scan over the roster, strictly sequentially, and
    /// publishes the ordered snapshot to result subscribers.
    ///
    /// # Errors
    ///
    /// * Returns [`CheckoutError::Busy`] if a scan is already in progress
    pub async fn scan(&self) -> Result<Vec<ServerStatus>, CheckoutError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CheckoutError::Busy);
        }

        log::debug!("Scanning {} servers", self.servers.len());
        let mut results = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let availability = self.step(server).await;
            results.push(ServerStatus {
                name: server.name.clone(),
                kind: server.kind,
                availability,
            });
        }

        let _ = self.results_tx.send(results.clone());
        self.scanning.store(false, Ordering::SeqCst);
        log::debug!("Scan complete");

        Ok(results)
    }

    /// One server's connect-checkout-disconnect cycle. Infallible by
    /// design: every failure mode degrades to "no availability".
    async fn step(&self, server: &ServerDescriptor) -> Option<Availability> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let url = match self.origin.endpoint(server.port) {
            Ok(url) => url,
            Err(e) => {
                log::error!("Could not resolve endpoint for {}: {e:?}", server.name);
                return None;
            }
        };

        log::debug!("Checking {} at {url}", server.name);
        let transport = match (self.connect)(url).await {
            Ok(transport) => transport,
            Err(e) => {
                log::debug!("Connection to {} failed: {e:?}", server.name);
                return None;
            }
        };

        if let Err(e) = self.session.begin_session(transport).await {
            log::error!("Could not bind transport for {}: {e:?}", server.name);
            return None;
        }

        // Step-scoped subscriptions, taken once the session is bound so the
        // state watch starts from this step's lifetime; both are dropped
        // before the next step begins so a late answer has nowhere to land.
        let mut state = self.session.subscribe_state();
        let mut events = self.status.subscribe();

        #[allow(clippy::redundant_pub_crate)]
        let availability = tokio::select!(
            availability = self.await_availability(&mut state, &mut events) => availability,
            () = (self.delay)() => {
                log::debug!("Status checkout timed out for {}", server.name);
                None
            }
        );

        // Anything recorded by a superseded step is discarded.
        let availability = if self.generation.load(Ordering::SeqCst) == generation {
            availability
        } else {
            log::trace!("Discarding stale checkout result for {}", server.name);
            None
        };

        // Confirm closure before advancing; the shared session can only
        // ever hold one live transport.
        if self.session.state() != SessionState::Disconnected {
            self.session.end_session().await;
            let _ = state
                .wait_for(|s| *s == SessionState::Disconnected)
                .await;
        }

        availability
    }

    async fn await_availability(
        &self,
        state: &mut watch::Receiver<SessionState>,
        events: &mut broadcast::Receiver<StatusEvent>,
    ) -> Option<Availability> {
        let reached_unregistered = match state
            .wait_for(|s| matches!(*s, SessionState::Unregistered | SessionState::Disconnected))
            .await
        {
            Ok(current) => *current == SessionState::Unregistered,
            Err(_) => false,
        };
        if !reached_unregistered {
            return None;
        }

        if let Err(e) = self.status.checkout().await {
            log::debug!("Checkout send failed: {e:?}");
            return None;
        }

        #[allow(clippy::redundant_pub_crate)]
        loop {
            tokio::select!(
                event = events.recv() => match event {
                    Ok(StatusEvent::Availability { current, capacity }) => {
                        return Some(Availability { current, capacity });
                    }
                    Err(broadcast::error::RecvError::Lagged(count)) => {
                        log::warn!("Status events lagged by {count}");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                disconnected = state.wait_for(|s| *s == SessionState::Disconnected) => {
                    drop(disconnected);
                    log::debug!("Session ended before a status answer arrived");
                    return None;
                }
            );
        }
    }
}
