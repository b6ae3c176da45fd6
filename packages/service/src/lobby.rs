//! The lobby sub-service: readiness, countdown, and room phase events.

use std::str::FromStr as _;

use strum_macros::EnumString;
use tokio::sync::broadcast;

use crate::args::Args;
use crate::{ServiceBroker, ServiceError, ServiceHandle, ServiceScope, ServiceSendError};

#[derive(Debug, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum LobbyKeyword {
    ReadyPlayer,
    WaitingForPlayer,
    BeginCountdown,
    EndCountdown,
    Playing,
    Waiting,
}

/// An inbound lobby event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEvent {
    /// The given peer declared readiness.
    ReadyPlayer(u64),
    /// The room is waiting on the given peer.
    WaitingForPlayer(u64),
    /// A game-start countdown of the given length, in milliseconds.
    BeginCountdown(u64),
    /// The countdown was aborted.
    EndCountdown,
    /// The room entered its playing phase.
    Playing,
    /// The room returned to its waiting phase.
    Waiting,
}

impl LobbyEvent {
    pub(crate) fn parse(payload: &str) -> Result<Self, ServiceError> {
        let (keyword, mut args) = Args::split(LobbyService::NAME, payload)?;
        match LobbyKeyword::from_str(keyword)
            .map_err(|_| Args::unknown_command(LobbyService::NAME, keyword))?
        {
            LobbyKeyword::ReadyPlayer => Ok(Self::ReadyPlayer(args.next("uid")?)),
            LobbyKeyword::WaitingForPlayer => Ok(Self::WaitingForPlayer(args.next("uid")?)),
            LobbyKeyword::BeginCountdown => Ok(Self::BeginCountdown(args.next("milliseconds")?)),
            LobbyKeyword::EndCountdown => Ok(Self::EndCountdown),
            LobbyKeyword::Playing => Ok(Self::Playing),
            LobbyKeyword::Waiting => Ok(Self::Waiting),
        }
    }
}

/// Typed frontend for the lobby sub-service.
pub struct LobbyService {
    handle: ServiceHandle,
    events_tx: broadcast::Sender<LobbyEvent>,
}

impl LobbyService {
    pub const NAME: &'static str = "Lobby";

    /// Registers the lobby service with the broker and starts its parse
    /// loop.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceError::DuplicateService`] if already started
    pub fn start(broker: &ServiceBroker) -> Result<Self, ServiceError> {
        let handle = broker.register(Self::NAME, ServiceScope::Room)?;
        let events_tx = broadcast::channel(64).0;
        crate::spawn_event_loop(&handle, events_tx.clone(), LobbyEvent::parse);
        Ok(Self { handle, events_tx })
    }

    /// Subscribes to inbound lobby events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<LobbyEvent> {
        self.events_tx.subscribe()
    }

    /// Declares the local player ready. Returns the request's sequence
    /// number.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceSendError::NotRegistered`] unless the session is
    ///   `Registered`
    pub async fn ready(&self) -> Result<u64, ServiceSendError> {
        self.handle.request("READY").await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_uid_events() {
        assert_eq!(
            LobbyEvent::parse("READY_PLAYER 5").unwrap(),
            LobbyEvent::ReadyPlayer(5)
        );
        assert_eq!(
            LobbyEvent::parse("WAITING_FOR_PLAYER 6").unwrap(),
            LobbyEvent::WaitingForPlayer(6)
        );
    }

    #[test]
    fn test_parse_countdown_events() {
        assert_eq!(
            LobbyEvent::parse("BEGIN_COUNTDOWN 3000").unwrap(),
            LobbyEvent::BeginCountdown(3000)
        );
        assert_eq!(
            LobbyEvent::parse("END_COUNTDOWN").unwrap(),
            LobbyEvent::EndCountdown
        );
    }

    #[test]
    fn test_parse_phase_events() {
        assert_eq!(LobbyEvent::parse("PLAYING").unwrap(), LobbyEvent::Playing);
        assert_eq!(LobbyEvent::parse("WAITING").unwrap(), LobbyEvent::Waiting);
    }

    #[test]
    fn test_parse_rejects_missing_countdown_length() {
        assert!(matches!(
            LobbyEvent::parse("BEGIN_COUNTDOWN"),
            Err(ServiceError::MissingArgument {
                argument: "milliseconds",
                ..
            })
        ));
    }
}
