use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("required binary '{0}' not found in PATH")]
    MissingBinary(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to render sandbox profile: {0}")]
    Render(String),
    #[error("failed to provision {}: {source}", path.display())]
    Provision {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cgroup controller '{0}' is not available on this host")]
    CgroupControllerUnavailable(String),
    #[error("interface name '{0}' exceeds the kernel limit of 15 bytes")]
    InvalidInterfaceName(String),
    #[error("failed to write sandbox profile {}: {source}", path.display())]
    ProfileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("identity provider error: {0}")]
    Identity(String),
    #[error("failed to start sandbox runtime: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("sandbox terminated by signal {signal}")]
    Terminated { signal: i32 },
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("user key didn't match")]
    KeyMismatch,
    #[error("failed to parse stored public key: {0}")]
    InvalidStoredKey(String),
    #[error("user is not renewed, refusing to issue temporary token")]
    NotRenewed,
    #[error("identity provider rejected request: {0}")]
    Provider(String),
}

impl From<nix::Error> for SandboxError {
    fn from(errno: nix::Error) -> Self {
        SandboxError::Io(std::io::Error::from(errno))
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
