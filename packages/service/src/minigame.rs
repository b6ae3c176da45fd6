//! The minigame sub-service: board events and moves.
//!
//! The payloads here describe board state changes; the rules of the games
//! themselves live server-side and are never interpreted by this client.

use std::str::FromStr as _;

use strum_macros::{AsRefStr, EnumString};
use tokio::sync::broadcast;

use crate::args::Args;
use crate::{ServiceBroker, ServiceError, ServiceHandle, ServiceScope, ServiceSendError};

#[derive(Debug, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum MinigameKeyword {
    Start,
    Stop,
    RoundFor,
    SquareState,
    Moved,
    PawnCounts,
    VictoryFor,
}

/// One side of a board game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    White,
    Black,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// What occupies a board square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SquareOccupancy {
    Free,
    White,
    Black,
}

/// An inbound minigame event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinigameEvent {
    /// A game started between the two uids, white first.
    Start { white: u64, black: u64 },
    /// The game was stopped before completion.
    Stop,
    /// Whose turn the new round belongs to.
    RoundFor(Side),
    /// A single square's occupancy.
    SquareState {
        line: u8,
        col: u8,
        state: SquareOccupancy,
    },
    /// A pawn moved between two squares.
    Moved {
        from_line: u8,
        from_col: u8,
        to_line: u8,
        to_col: u8,
    },
    /// Remaining pawn counts per side.
    PawnCounts { white: u32, black: u32 },
    /// The game ended with a winner.
    VictoryFor(Side),
}

impl MinigameEvent {
    pub(crate) fn parse(payload: &str) -> Result<Self, ServiceError> {
        let (keyword, mut args) = Args::split(MinigameService::NAME, payload)?;
        match MinigameKeyword::from_str(keyword)
            .map_err(|_| Args::unknown_command(MinigameService::NAME, keyword))?
        {
            MinigameKeyword::Start => Ok(Self::Start {
                white: args.next("white")?,
                black: args.next("black")?,
            }),
            MinigameKeyword::Stop => Ok(Self::Stop),
            MinigameKeyword::RoundFor => Ok(Self::RoundFor(args.next("side")?)),
            MinigameKeyword::SquareState => Ok(Self::SquareState {
                line: args.next("line")?,
                col: args.next("col")?,
                state: args.next("state")?,
            }),
            MinigameKeyword::Moved => Ok(Self::Moved {
                from_line: args.next("fromLine")?,
                from_col: args.next("fromCol")?,
                to_line: args.next("toLine")?,
                to_col: args.next("toCol")?,
            }),
            MinigameKeyword::PawnCounts => Ok(Self::PawnCounts {
                white: args.next("white")?,
                black: args.next("black")?,
            }),
            MinigameKeyword::VictoryFor => Ok(Self::VictoryFor(args.next("side")?)),
        }
    }
}

/// An outbound minigame request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinigameRequest {
    /// Move a pawn between two squares.
    Move {
        from_line: u8,
        from_col: u8,
        to_line: u8,
        to_col: u8,
    },
    /// Resign from the current game.
    End,
}

impl MinigameRequest {
    /// Decodes a request payload, the inverse of its `Display` encoding.
    ///
    /// # Errors
    ///
    /// * If the keyword or an argument does not match the request grammar
    pub fn parse(payload: &str) -> Result<Self, ServiceError> {
        let (keyword, mut args) = Args::split(MinigameService::NAME, payload)?;
        match keyword {
            "MOVE" => Ok(Self::Move {
                from_line: args.next("fromLine")?,
                from_col: args.next("fromCol")?,
                to_line: args.next("toLine")?,
                to_col: args.next("toCol")?,
            }),
            "END" => Ok(Self::End),
            _ => Err(Args::unknown_command(MinigameService::NAME, keyword)),
        }
    }
}

impl std::fmt::Display for MinigameRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Move {
                from_line,
                from_col,
                to_line,
                to_col,
            } => write!(f, "MOVE {from_line} {from_col} {to_line} {to_col}"),
            Self::End => f.write_str("END"),
        }
    }
}

/// Typed frontend for the minigame sub-service.
pub struct MinigameService {
    handle: ServiceHandle,
    events_tx: broadcast::Sender<MinigameEvent>,
}

impl MinigameService {
    pub const NAME: &'static str = "Minigame";

    /// Registers the minigame service with the broker and starts its parse
    /// loop.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceError::DuplicateService`] if already started
    pub fn start(broker: &ServiceBroker) -> Result<Self, ServiceError> {
        let handle = broker.register(Self::NAME, ServiceScope::Room)?;
        let events_tx = broadcast::channel(64).0;
        crate::spawn_event_loop(&handle, events_tx.clone(), MinigameEvent::parse);
        Ok(Self { handle, events_tx })
    }

    /// Subscribes to inbound minigame events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MinigameEvent> {
        self.events_tx.subscribe()
    }

    /// Sends a request to the game server. Returns the request's sequence
    /// number.
    ///
    /// # Errors
    ///
    /// * Returns [`ServiceSendError::NotRegistered`] unless the session is
    ///   `Registered`
    pub async fn send(&self, request: &MinigameRequest) -> Result<u64, ServiceSendError> {
        self.handle.request(&request.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_move_round_trip() {
        let request = MinigameRequest::Move {
            from_line: 1,
            from_col: 2,
            to_line: 3,
            to_col: 4,
        };

        let encoded = request.to_string();
        assert_eq!(encoded, "MOVE 1 2 3 4");
        assert_eq!(MinigameRequest::parse(&encoded).unwrap(), request);
    }

    #[test]
    fn test_end_round_trip() {
        assert_eq!(MinigameRequest::End.to_string(), "END");
        assert_eq!(
            MinigameRequest::parse("END").unwrap(),
            MinigameRequest::End
        );
    }

    #[test]
    fn test_parse_start_and_victory() {
        assert_eq!(
            MinigameEvent::parse("START 7 3").unwrap(),
            MinigameEvent::Start { white: 7, black: 3 }
        );
        assert_eq!(
            MinigameEvent::parse("VICTORY_FOR BLACK").unwrap(),
            MinigameEvent::VictoryFor(Side::Black)
        );
    }

    #[test]
    fn test_parse_square_state() {
        assert_eq!(
            MinigameEvent::parse("SQUARE_STATE 4 5 WHITE").unwrap(),
            MinigameEvent::SquareState {
                line: 4,
                col: 5,
                state: SquareOccupancy::White
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_enumerator() {
        assert!(matches!(
            MinigameEvent::parse("ROUND_FOR GREEN"),
            Err(ServiceError::InvalidArgument { value, .. }) if value == "GREEN"
        ));
    }

    #[test]
    fn test_parse_moved_and_pawn_counts() {
        assert_eq!(
            MinigameEvent::parse("MOVED 0 1 2 3").unwrap(),
            MinigameEvent::Moved {
                from_line: 0,
                from_col: 1,
                to_line: 2,
                to_col: 3
            }
        );
        assert_eq!(
            MinigameEvent::parse("PAWN_COUNTS 8 6").unwrap(),
            MinigameEvent::PawnCounts { white: 8, black: 6 }
        );
    }
}
