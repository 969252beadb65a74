use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

/// A user as known to the identity provider.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: u32,
    pub username: String,
    #[serde(default)]
    pub ssh_key: String,
    pub renewed: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    PublicKey,
}

/// Everything learned about a connection while authenticating it.
#[derive(Clone, Debug)]
pub struct SessionState {
    pub user: UserIdentity,
    pub token: String,
    /// The login name carried the `-ws` suffix.
    pub direct_login: bool,
    pub method: AuthMethod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub window: WindowSize,
}

/// Signal names a remote client may deliver to its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteSignal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
    Usr1,
    Usr2,
    Other,
}

impl RemoteSignal {
    /// Accepts names with or without the `SIG` prefix, any case.
    pub fn from_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "ABRT" => Self::Abrt,
            "ALRM" => Self::Alrm,
            "FPE" => Self::Fpe,
            "HUP" => Self::Hup,
            "ILL" => Self::Ill,
            "INT" => Self::Int,
            "KILL" => Self::Kill,
            "PIPE" => Self::Pipe,
            "QUIT" => Self::Quit,
            "SEGV" => Self::Segv,
            "TERM" => Self::Term,
            "USR1" => Self::Usr1,
            "USR2" => Self::Usr2,
            _ => Self::Other,
        }
    }

    /// Untranslatable signals terminate.
    pub fn to_os(self) -> Signal {
        match self {
            Self::Abrt => Signal::SIGABRT,
            Self::Alrm => Signal::SIGALRM,
            Self::Fpe => Signal::SIGFPE,
            Self::Hup => Signal::SIGHUP,
            Self::Ill => Signal::SIGILL,
            Self::Int => Signal::SIGINT,
            Self::Kill => Signal::SIGKILL,
            Self::Pipe => Signal::SIGPIPE,
            Self::Quit => Signal::SIGQUIT,
            Self::Segv => Signal::SIGSEGV,
            Self::Term | Self::Other => Signal::SIGTERM,
            Self::Usr1 => Signal::SIGUSR1,
            Self::Usr2 => Signal::SIGUSR2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_map_to_os_signals() {
        assert_eq!(RemoteSignal::from_name("INT").to_os(), Signal::SIGINT);
        assert_eq!(RemoteSignal::from_name("sigusr2").to_os(), Signal::SIGUSR2);
        assert_eq!(RemoteSignal::from_name("KILL").to_os(), Signal::SIGKILL);
        assert_eq!(RemoteSignal::from_name("WINCH"), RemoteSignal::Other);
        assert_eq!(RemoteSignal::from_name("WINCH").to_os(), Signal::SIGTERM);
    }

    #[test]
    fn user_identity_tolerates_missing_key() {
        let user: UserIdentity = serde_json::from_str(
            r#"{"id": 42, "username": "alice", "renewed": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(user.id, 42);
        assert!(user.ssh_key.is_empty());
    }
}
