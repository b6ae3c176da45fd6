//! The status sub-service: occupancy checkout against a game server.
//!
//! Unlike the room services, status is connection-scoped: the checkout
//! probe is issued as soon as a transport is bound, without registering a
//! player identity first.

use std::str::FromStr as _;

use strum_macros::EnumString;
use tokio::sync::broadcast;

use crate::args::Args;
use crate::{ServiceBroker, ServiceError, ServiceHandle, ServiceScope, ServiceSendError};

#[derive(Debug, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum StatusKeyword {
    Availability,
}

/// An inbound status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// The server's current occupancy and capacity.
    Availability { current: u32, capacity: u32 },
}

impl StatusEvent {
    pub(crate) fn parse(payload: &str) -> Result<Self, ServiceError> {
        let (keyword, mut args) = Args::split(StatusService::NAME, payload)?;
        match StatusKeyword::from_str(keyword)
            .map_err(|_| Args::unknown_command(StatusService::NAME, keyword))?
        {
            StatusKeyword::Availability => Ok(Self::Availability {
                current: args.next("current")?,
                capacity: args.next("capacity")?,
            }),
        }
    }
}

/// Typed frontend for the status sub-service.
pub struct StatusService {
    handle: ServiceHandle,
    events_tx: broadcast::Sender<StatusEvent>,
}

impl StatusService {
    pub const NAME: &'static str = "Status";

    /// Registers the status service with the broker and starts its parse
    /// loop.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceError::DuplicateService`] if already started
    pub fn start(broker: &ServiceBroker) -> Result<Self, ServiceError> {
        let handle = broker.register(Self::NAME, ServiceScope::Connection)?;
        let events_tx = broadcast::channel(16).0;
        crate::spawn_event_loop(&handle, events_tx.clone(), StatusEvent::parse);
        Ok(Self { handle, events_tx })
    }

    /// Subscribes to inbound status events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events_tx.subscribe()
    }

    /// Asks the connected server for its occupancy. Returns the request's
    /// sequence number.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceSendError::NotRegistered`] if no transport is
    ///   bound
    pub async fn checkout(&self) -> Result<u64, ServiceSendError> {
        self.handle.request("CHECKOUT").await
    }
}
