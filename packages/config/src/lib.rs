//! Static configuration for the `GameBox` client.
//!
//! This crate owns the roster of known game servers and the rules for turning
//! a page origin plus a server port into a `WebSocket` endpoint. The roster is
//! loaded once at startup and is immutable for the process lifetime.

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while reading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The page origin uses a scheme with no `WebSocket` counterpart.
    #[error("Unsupported origin scheme: {0:?}")]
    UnsupportedScheme(String),
    /// A server entry carries a game-kind code outside the known set.
    #[error("Unknown game kind code: {0:?}")]
    UnknownGameKind(char),
    /// The servers roster failed to deserialize.
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

/// The board game a server hosts, identified on the wire and in
/// configuration by a single-letter code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub enum GameKind {
    Pawns,
    Checkers,
    Reversi,
}

impl GameKind {
    /// The single-letter configuration code for this game kind.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Pawns => 'P',
            Self::Checkers => 'C',
            Self::Reversi => 'R',
        }
    }
}

impl TryFrom<char> for GameKind {
    type Error = ConfigError;

    fn try_from(code: char) -> Result<Self, Self::Error> {
        match code {
            'P' => Ok(Self::Pawns),
            'C' => Ok(Self::Checkers),
            'R' => Ok(Self::Reversi),
            _ => Err(ConfigError::UnknownGameKind(code)),
        }
    }
}

impl From<GameKind> for char {
    fn from(kind: GameKind) -> Self {
        kind.code()
    }
}

/// A known game server: display name, hosted game, and the port it listens
/// on relative to the page origin's hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    pub name: String,
    pub kind: GameKind,
    pub port: u16,
}

static KNOWN_SERVERS: LazyLock<Vec<ServerDescriptor>> = LazyLock::new(|| {
    vec![
        ServerDescriptor {
            name: "Pawns Arena".to_string(),
            kind: GameKind::Pawns,
            port: 35555,
        },
        ServerDescriptor {
            name: "Checkers Den".to_string(),
            kind: GameKind::Checkers,
            port: 35556,
        },
        ServerDescriptor {
            name: "Reversi Corner".to_string(),
            kind: GameKind::Reversi,
            port: 35557,
        },
    ]
});

/// The built-in roster of known game servers, in scan order.
#[must_use]
pub fn known_servers() -> &'static [ServerDescriptor] {
    &KNOWN_SERVERS
}

/// Deserializes a servers roster from its JSON representation.
///
/// # Errors
///
/// * If the JSON is malformed or a game-kind code is unknown
pub fn load_servers(json: &str) -> Result<Vec<ServerDescriptor>, ConfigError> {
    Ok(serde_json::from_str(json)?)
}

/// The scheme and hostname of the page the client is served from.
///
/// Game servers share the page's hostname and differ only by port, so this
/// is all that is needed to resolve a transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: String,
    host: String,
}

impl Origin {
    #[must_use]
    pub fn new(scheme: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
        }
    }

    /// The `WebSocket` scheme corresponding to this origin's scheme.
    ///
    /// # Errors
    ///
    /// * If the origin scheme is neither `http` nor `https`
    pub fn ws_scheme(&self) -> Result<&'static str, ConfigError> {
        match self.scheme.as_str() {
            "http" => Ok("ws"),
            "https" => Ok("wss"),
            _ => Err(ConfigError::UnsupportedScheme(self.scheme.clone())),
        }
    }

    /// Resolves the fully-qualified transport endpoint for a server port.
    ///
    /// # Errors
    ///
    /// * If the origin scheme is neither `http` nor `https`
    pub fn endpoint(&self, port: u16) -> Result<String, ConfigError> {
        Ok(format!("{}://{}:{port}/", self.ws_scheme()?, self.host))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_endpoint_resolves_http_to_ws() {
        let origin = Origin::new("http", "play.example.com");
        assert_eq!(
            origin.endpoint(35555).unwrap(),
            "ws://play.example.com:35555/"
        );
    }

    #[test]
    fn test_endpoint_resolves_https_to_wss() {
        let origin = Origin::new("https", "play.example.com");
        assert_eq!(
            origin.endpoint(35556).unwrap(),
            "wss://play.example.com:35556/"
        );
    }

    #[test]
    fn test_endpoint_rejects_unknown_scheme() {
        let origin = Origin::new("ftp", "play.example.com");
        assert!(matches!(
            origin.endpoint(35555),
            Err(ConfigError::UnsupportedScheme(scheme)) if scheme == "ftp"
        ));
    }

    #[test]
    fn test_game_kind_codes_round_trip() {
        for kind in [GameKind::Pawns, GameKind::Checkers, GameKind::Reversi] {
            assert_eq!(GameKind::try_from(kind.code()).unwrap(), kind);
        }
    }

    #[test]
    fn test_game_kind_rejects_unknown_code() {
        assert!(matches!(
            GameKind::try_from('X'),
            Err(ConfigError::UnknownGameKind('X'))
        ));
    }

    #[test]
    fn test_load_servers_parses_roster() {
        let servers = load_servers(
            r#"[
                {"name": "Pawns Arena", "kind": "P", "port": 35555},
                {"name": "Checkers Den", "kind": "C", "port": 35556}
            ]"#,
        )
        .unwrap();

        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "Pawns Arena");
        assert_eq!(servers[0].kind, GameKind::Pawns);
        assert_eq!(servers[0].port, 35555);
        assert_eq!(servers[1].kind, GameKind::Checkers);
    }

    #[test]
    fn test_load_servers_rejects_unknown_kind() {
        let result = load_servers(r#"[{"name": "Mystery", "kind": "Z", "port": 1}]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_known_servers_are_in_scan_order() {
        let servers = known_servers();
        assert_eq!(servers.len(), 3);
        assert!(servers.windows(2).all(|w| w[0].port < w[1].port));
    }
}
