//! Line grammar of the registration protocol.
//!
//! Lines are whitespace-delimited tokens, first token a keyword. The
//! `SERVICE` family is not interpreted here; it is passed through verbatim
//! for the sub-service layer.

use std::str::FromStr as _;

use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

use crate::models::Actor;

/// Errors raised while interpreting a registration-protocol line.
///
/// All of these are fatal to the session: the stream can no longer be
/// trusted once a line fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Empty line from server")]
    EmptyLine,
    #[error("Unknown keyword: {0:?}")]
    UnknownKeyword(String),
    #[error("Malformed {keyword} line: {detail}")]
    Malformed { keyword: String, detail: String },
}

#[derive(Debug, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum ServerKeyword {
    Registration,
    LoggedIn,
    LoggedOut,
    Interrupt,
    Service,
}

/// One parsed inbound line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ServerLine {
    /// Handshake success: self first, then every already-connected peer.
    Registration(Vec<Actor>),
    LoggedIn(Actor),
    LoggedOut(u64),
    Interrupt,
    /// A sub-service line, preserved verbatim.
    Service(String),
}

/// The handshake request line for the given identity.
pub(crate) fn login_line(uid: u64, name: &str) -> String {
    format!("LOGIN {uid} {name}")
}

pub(crate) fn parse_line(line: &str) -> Result<ServerLine, ProtocolError> {
    let mut tokens = line.split_whitespace();
    let keyword = tokens.next().ok_or(ProtocolError::EmptyLine)?;
    let keyword = ServerKeyword::from_str(keyword)
        .map_err(|_| ProtocolError::UnknownKeyword(keyword.to_string()))?;

    match keyword {
        ServerKeyword::Registration => {
            let mut actors = vec![];
            while let Some(uid) = tokens.next() {
                let uid = parse_uid(&keyword, uid)?;
                let name = tokens.next().ok_or_else(|| ProtocolError::Malformed {
                    keyword: keyword.as_ref().to_string(),
                    detail: format!("Missing name for uid {uid}"),
                })?;
                actors.push(Actor {
                    uid,
                    name: name.to_string(),
                });
            }
            if actors.is_empty() {
                return Err(ProtocolError::Malformed {
                    keyword: keyword.as_ref().to_string(),
                    detail: "Missing self identity".to_string(),
                });
            }
            Ok(ServerLine::Registration(actors))
        }
        ServerKeyword::LoggedIn => {
            let uid = parse_uid(&keyword, tokens.next().ok_or_else(|| missing(&keyword, "uid"))?)?;
            let name = tokens.next().ok_or_else(|| missing(&keyword, "name"))?;
            Ok(ServerLine::LoggedIn(Actor {
                uid,
                name: name.to_string(),
            }))
        }
        ServerKeyword::LoggedOut => {
            let uid = parse_uid(&keyword, tokens.next().ok_or_else(|| missing(&keyword, "uid"))?)?;
            Ok(ServerLine::LoggedOut(uid))
        }
        ServerKeyword::Interrupt => Ok(ServerLine::Interrupt),
        ServerKeyword::Service => Ok(ServerLine::Service(line.to_string())),
    }
}

fn missing(keyword: &ServerKeyword, argument: &str) -> ProtocolError {
    ProtocolError::Malformed {
        keyword: keyword.as_ref().to_string(),
        detail: format!("Missing {argument}"),
    }
}

fn parse_uid(keyword: &ServerKeyword, token: &str) -> Result<u64, ProtocolError> {
    token.parse().map_err(|_| ProtocolError::Malformed {
        keyword: keyword.as_ref().to_string(),
        detail: format!("Invalid uid {token:?}"),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_registration_lists_self_then_peers() {
        let line = parse_line("REGISTRATION 7 alice 3 bob 9 carol").unwrap();

        assert_eq!(
            line,
            ServerLine::Registration(vec![
                Actor {
                    uid: 7,
                    name: "alice".to_string()
                },
                Actor {
                    uid: 3,
                    name: "bob".to_string()
                },
                Actor {
                    uid: 9,
                    name: "carol".to_string()
                },
            ])
        );
    }

    #[test]
    fn test_parse_registration_requires_self() {
        assert!(matches!(
            parse_line("REGISTRATION"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_registration_rejects_dangling_uid() {
        assert!(matches!(
            parse_line("REGISTRATION 7 alice 3"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_logged_in_and_out() {
        assert_eq!(
            parse_line("LOGGED_IN 4 dave").unwrap(),
            ServerLine::LoggedIn(Actor {
                uid: 4,
                name: "dave".to_string()
            })
        );
        assert_eq!(parse_line("LOGGED_OUT 4").unwrap(), ServerLine::LoggedOut(4));
    }

    #[test]
    fn test_parse_rejects_non_numeric_uid() {
        assert!(matches!(
            parse_line("LOGGED_OUT dave"),
            Err(ProtocolError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_unknown_keyword() {
        assert_eq!(
            parse_line("BANANA 1 2"),
            Err(ProtocolError::UnknownKeyword("BANANA".to_string()))
        );
    }

    #[test]
    fn test_service_lines_pass_through_verbatim() {
        assert_eq!(
            parse_line("SERVICE EVENT Chat MESSAGE_FROM 3 hello there").unwrap(),
            ServerLine::Service("SERVICE EVENT Chat MESSAGE_FROM 3 hello there".to_string())
        );
    }

    #[test]
    fn test_login_line_encoding() {
        assert_eq!(login_line(12, "alice"), "LOGIN 12 alice");
    }
}
