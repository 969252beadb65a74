use crate::errors::SandboxResult;
use crate::models::{PtyRequest, RemoteSignal, UserIdentity, WindowSize};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// User lookup and token minting, backed by IAM in production.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// Exchanges a password for a user token.
    async fn login(&self, username: &str, password: &str) -> SandboxResult<String>;
    async fn get_user(&self, username: &str) -> SandboxResult<UserIdentity>;
    async fn issue_token(&self, username: &str, duration: &str) -> SandboxResult<String>;
}

/// Source of inbound connections. The remote-login protocol itself lives
/// behind this trait.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Must be cancel safe: the server drops pending calls on shutdown.
    async fn accept(&self) -> SandboxResult<Box<dyn Connection>>;
}

#[derive(Clone, Debug)]
pub enum AuthAttempt {
    Password(String),
    PublicKey(ssh_key::PublicKey),
}

#[async_trait]
pub trait Connection: Send {
    fn remote_addr(&self) -> String;
    fn username(&self) -> String;
    /// `None` once the client gives up authenticating.
    async fn next_auth_attempt(&mut self) -> Option<AuthAttempt>;
    async fn auth_result(&mut self, accepted: bool);
    async fn open_session(&mut self) -> SandboxResult<RemoteSession>;
    async fn exit(&mut self, session: RemoteSession, status: u32) -> SandboxResult<()>;
}

/// One session channel as seen by the sandbox side.
pub struct RemoteSession {
    pub remote_addr: String,
    pub raw_command: String,
    pub pty: Option<PtyRequest>,
    pub resizes: mpsc::Receiver<WindowSize>,
    pub signals: mpsc::Receiver<RemoteSignal>,
    pub stdin: BoxedReader,
    pub stdout: BoxedWriter,
    pub stderr: BoxedWriter,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("remote_addr", &self.remote_addr)
            .field("raw_command", &self.raw_command)
            .field("pty", &self.pty)
            .finish_non_exhaustive()
    }
}

/// Sender halves paired with a [`RemoteSession`], held by whoever feeds it
/// events.
#[derive(Clone, Debug)]
pub struct SessionEvents {
    pub resizes: mpsc::Sender<WindowSize>,
    pub signals: mpsc::Sender<RemoteSignal>,
}

impl RemoteSession {
    pub fn new(
        remote_addr: impl Into<String>,
        raw_command: impl Into<String>,
        pty: Option<PtyRequest>,
        stdin: BoxedReader,
        stdout: BoxedWriter,
        stderr: BoxedWriter,
    ) -> (Self, SessionEvents) {
        let (resize_tx, resize_rx) = mpsc::channel(16);
        let (signal_tx, signal_rx) = mpsc::channel(16);
        let session = Self {
            remote_addr: remote_addr.into(),
            raw_command: raw_command.into(),
            pty,
            resizes: resize_rx,
            signals: signal_rx,
            stdin,
            stdout,
            stderr,
        };
        let events = SessionEvents {
            resizes: resize_tx,
            signals: signal_tx,
        };
        (session, events)
    }
}
