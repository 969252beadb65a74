use crate::config::JailConfig;
use crate::errors::SandboxResult;
use crate::models::SessionState;
use crate::profile;
use crate::service::RemoteSession;
use crate::supervisor::Supervisor;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Exit status reported when a session could not be run at all.
pub const SESSION_ERROR_STATUS: u32 = 255;

/// Runs authenticated sessions: render a profile, supervise the sandbox,
/// clean up the profile.
#[derive(Clone, Debug)]
pub struct SessionHandler {
    jail: Arc<JailConfig>,
    supervisor: Supervisor,
    path_var: String,
}

impl SessionHandler {
    pub fn new(jail: Arc<JailConfig>, supervisor: Supervisor, path_var: impl Into<String>) -> Self {
        Self {
            jail,
            supervisor,
            path_var: path_var.into(),
        }
    }

    /// Returns the exit status to report to the client. Failures are logged
    /// and written to the session's stderr.
    pub async fn handle(&self, state: &SessionState, session: &mut RemoteSession) -> u32 {
        info!(
            "opened session for {} (id {}) from {}: command={:?} pty={} direct={}",
            state.user.username,
            state.user.id,
            session.remote_addr,
            session.raw_command,
            session.pty.is_some(),
            state.direct_login
        );

        match self.run(state, session).await {
            Ok(status) => {
                info!("session for {} exited with {status}", state.user.username);
                status
            }
            Err(e) => {
                error!("session for {} failed: {e}", state.user.username);
                let message = format!("Error: {e}\r\n");
                if let Err(write_error) = session.stderr.write_all(message.as_bytes()).await {
                    debug!("failed to report error to client: {write_error}");
                }
                let _ = session.stderr.flush().await;
                SESSION_ERROR_STATUS
            }
        }
    }

    async fn run(&self, state: &SessionState, session: &mut RemoteSession) -> SandboxResult<u32> {
        let profile = profile::render(
            &self.jail,
            &state.user,
            &state.token,
            &self.path_var,
            &session.raw_command,
        )
        .await?;
        let result = self.supervisor.run(profile.path(), session).await;
        profile.remove().await;
        result
    }
}
