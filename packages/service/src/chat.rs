//! The chat sub-service: free-text messages between everyone in the room.

use std::str::FromStr as _;

use strum_macros::EnumString;
use tokio::sync::broadcast;

use crate::args::Args;
use crate::{ServiceBroker, ServiceError, ServiceHandle, ServiceScope, ServiceSendError};

#[derive(Debug, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum ChatKeyword {
    MessageFrom,
}

/// An inbound chat event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A message authored by the peer with the given uid.
    MessageFrom { author: u64, text: String },
}

impl ChatEvent {
    pub(crate) fn parse(payload: &str) -> Result<Self, ServiceError> {
        let (keyword, mut args) = Args::split(ChatService::NAME, payload)?;
        match ChatKeyword::from_str(keyword)
            .map_err(|_| Args::unknown_command(ChatService::NAME, keyword))?
        {
            ChatKeyword::MessageFrom => Ok(Self::MessageFrom {
                author: args.next("author")?,
                text: args.remainder().to_string(),
            }),
        }
    }
}

/// Typed frontend for the chat sub-service.
pub struct ChatService {
    handle: ServiceHandle,
    events_tx: broadcast::Sender<ChatEvent>,
}

impl ChatService {
    pub const NAME: &'static str = "Chat";

    /// Registers the chat service with the broker and starts its parse
    /// loop.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceError::DuplicateService`] if already started
    pub fn start(broker: &ServiceBroker) -> Result<Self, ServiceError> {
        let handle = broker.register(Self::NAME, ServiceScope::Room)?;
        let events_tx = broadcast::channel(64).0;
        crate::spawn_event_loop(&handle, events_tx.clone(), ChatEvent::parse);
        Ok(Self { handle, events_tx })
    }

    /// Subscribes to inbound chat events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events_tx.subscribe()
    }

    /// Sends a chat message to the room. Returns the request's sequence
    /// number.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceSendError::NotRegistered`] unless the session is
    ///   `Registered`
    pub async fn send_message(&self, text: &str) -> Result<u64, ServiceSendError> {
        self.handle.request(&format!("MESSAGE {text}")).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_message_from_keeps_full_text() {
        assert_eq!(
            ChatEvent::parse("MESSAGE_FROM 3 see you at the lobby").unwrap(),
            ChatEvent::MessageFrom {
                author: 3,
                text: "see you at the lobby".to_string()
            }
        );
    }

    #[test]
    fn test_parse_message_from_allows_empty_text() {
        assert_eq!(
            ChatEvent::parse("MESSAGE_FROM 3").unwrap(),
            ChatEvent::MessageFrom {
                author: 3,
                text: String::new()
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_keyword() {
        assert!(matches!(
            ChatEvent::parse("FOO bar"),
            Err(ServiceError::UnknownCommand { keyword, .. }) if keyword == "FOO"
        ));
    }

    #[test]
    fn test_parse_rejects_non_numeric_author() {
        assert!(matches!(
            ChatEvent::parse("MESSAGE_FROM bob hi"),
            Err(ServiceError::InvalidArgument { argument: "author", .. })
        ));
    }
}
