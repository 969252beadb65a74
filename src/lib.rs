pub mod addressing;
pub mod auth;
pub mod command;
pub mod config;
pub mod console;
pub mod errors;
pub mod handler;
pub mod iam;
pub mod models;
pub mod network;
pub mod profile;
pub mod provision;
pub mod pty;
pub mod server;
pub mod service;
pub mod supervisor;

pub use auth::Authenticator;
pub use config::Config;
pub use errors::{AuthError, SandboxError, SandboxResult};
pub use handler::SessionHandler;
pub use iam::IamClient;
pub use network::NetworkManager;
pub use profile::{render, ProfileFile};
pub use provision::provision;
pub use server::Server;
pub use supervisor::Supervisor;

/// PATH exported inside the sandbox when the host has none.
pub const DEFAULT_SANDBOX_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub const DEFAULT_LOG_DIR: &str = "/var/log/shhd";

/// PATH for sandboxed shells, inherited from the daemon's environment.
pub fn sandbox_path() -> String {
    std::env::var("PATH")
        .ok()
        .filter(|path| !path.is_empty())
        .unwrap_or_else(|| DEFAULT_SANDBOX_PATH.to_string())
}
