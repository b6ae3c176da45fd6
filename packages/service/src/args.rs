//! Token-level parsing of sub-service payloads.
//!
//! Every payload is a command keyword followed by whitespace-delimited
//! arguments matching a fixed, ordered schema. The cursor here gives each
//! grammar typed access to the next argument and produces the shared
//! [`ServiceError`] variants on mismatch.

use std::str::FromStr;

use crate::ServiceError;

/// Cursor over the arguments of one command payload.
pub(crate) struct Args<'a> {
    service: &'static str,
    command: &'a str,
    rest: &'a str,
}

impl<'a> Args<'a> {
    /// Splits a payload into its command keyword and an argument cursor.
    pub(crate) fn split(
        service: &'static str,
        payload: &'a str,
    ) -> Result<(&'a str, Self), ServiceError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(ServiceError::MissingCommand {
                service: service.to_string(),
            });
        }
        let (command, rest) = payload
            .split_once(' ')
            .map_or((payload, ""), |(command, rest)| (command, rest));
        Ok((
            command,
            Self {
                service,
                command,
                rest,
            },
        ))
    }

    /// The error for a command keyword outside the service's grammar.
    pub(crate) fn unknown_command(service: &'static str, keyword: &str) -> ServiceError {
        ServiceError::UnknownCommand {
            service: service.to_string(),
            keyword: keyword.to_string(),
        }
    }

    pub(crate) fn next_token(&mut self, argument: &'static str) -> Result<&'a str, ServiceError> {
        let rest = self.rest.trim_start();
        if rest.is_empty() {
            return Err(ServiceError::MissingArgument {
                service: self.service.to_string(),
                command: self.command.to_string(),
                argument,
            });
        }
        let (token, rest) = rest.split_once(' ').map_or((rest, ""), |(t, r)| (t, r));
        self.rest = rest;
        Ok(token)
    }

    /// Parses the next token as any `FromStr` type (numbers, enumerator
    /// keywords).
    pub(crate) fn next<T: FromStr>(&mut self, argument: &'static str) -> Result<T, ServiceError> {
        let token = self.next_token(argument)?;
        token.parse().map_err(|_| ServiceError::InvalidArgument {
            service: self.service.to_string(),
            command: self.command.to_string(),
            argument,
            value: token.to_string(),
        })
    }

    /// Everything left of the payload, for free-text trailers.
    pub(crate) fn remainder(&mut self) -> &'a str {
        let rest = self.rest.trim();
        self.rest = "";
        rest
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_split_extracts_command_and_arguments() {
        let (command, mut args) = Args::split("Chat", "MESSAGE_FROM 42 hello there").unwrap();

        assert_eq!(command, "MESSAGE_FROM");
        assert_eq!(args.next::<u64>("author").unwrap(), 42);
        assert_eq!(args.remainder(), "hello there");
    }

    #[test]
    fn test_split_rejects_empty_payload() {
        assert!(matches!(
            Args::split("Chat", "   "),
            Err(ServiceError::MissingCommand { .. })
        ));
    }

    #[test]
    fn test_next_rejects_non_numeric_token() {
        let (_, mut args) = Args::split("Lobby", "READY_PLAYER soon").unwrap();

        assert!(matches!(
            args.next::<u64>("uid"),
            Err(ServiceError::InvalidArgument { value, .. }) if value == "soon"
        ));
    }

    #[test]
    fn test_next_reports_missing_argument() {
        let (_, mut args) = Args::split("Lobby", "READY_PLAYER").unwrap();

        assert!(matches!(
            args.next::<u64>("uid"),
            Err(ServiceError::MissingArgument {
                argument: "uid",
                ..
            })
        ));
    }

    #[test]
    fn test_remainder_may_be_empty() {
        let (_, mut args) = Args::split("Chat", "MESSAGE_FROM 1").unwrap();
        let _ = args.next::<u64>("author").unwrap();

        assert_eq!(args.remainder(), "");
    }
}
