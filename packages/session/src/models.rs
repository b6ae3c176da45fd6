use strum_macros::AsRefStr;

/// A participant visible in the current session, uniquely identified by
/// `uid` for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub uid: u64,
    pub name: String,
}

/// Where the session currently stands. Exactly one state holds at any
/// instant; `Disconnected` is both the initial and the terminal state of
/// every transport's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum SessionState {
    Disconnected,
    Unregistered,
    Registered,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
