use crate::auth::Authenticator;
use crate::config::Config;
use crate::errors::SandboxResult;
use crate::handler::SessionHandler;
use crate::models::SessionState;
use crate::network::NetworkManager;
use crate::provision::provision;
use crate::service::{Connection, IdentityProvider, Transport};
use crate::supervisor::Supervisor;
use crate::sandbox_path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Authentication attempts allowed per connection.
pub const MAX_AUTH_ATTEMPTS: usize = 6;
/// How long `stop` waits for the accept loop to wind down.
pub const STOP_GRACE: Duration = Duration::from_secs(2);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The shell server: owns its configuration and the accept loop over a
/// [`Transport`].
pub struct Server<T: Transport> {
    config: Arc<Config>,
    transport: Arc<T>,
    identity: Arc<dyn IdentityProvider>,
    running: Option<Running>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    accept_loop: JoinHandle<JoinSet<()>>,
}

struct ConnectionContext {
    authenticator: Authenticator,
    handler: SessionHandler,
}

impl<T: Transport> Server<T> {
    pub fn new(config: Config, transport: Arc<T>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            identity,
            running: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.accept_loop.is_finished())
    }

    /// Prepares host resources, then starts accepting connections. Any
    /// failure before the accept loop starts is returned.
    pub async fn start(&mut self) -> SandboxResult<()> {
        if self.running.is_some() {
            debug!("server already started");
            return Ok(());
        }

        let jail = Arc::new(self.config.jail.clone());
        provision(&jail)?;
        if jail.network.enabled() {
            NetworkManager::new()?.setup(&jail.network).await?;
        }

        let supervisor = Supervisor::new(&jail.runtime)?;
        let context = Arc::new(ConnectionContext {
            authenticator: Authenticator::new(
                self.identity.clone(),
                self.config.iam.login_validity(),
            ),
            handler: SessionHandler::new(jail, supervisor, sandbox_path()),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_loop = tokio::spawn(accept_loop(self.transport.clone(), context, shutdown_rx));
        self.running = Some(Running {
            shutdown,
            accept_loop,
        });
        info!("server started (listen address {})", self.config.ssh.listen_address);
        Ok(())
    }

    /// Stops accepting connections. Connections already accepted keep
    /// running on their own until their sessions end.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(true);

        let mut accept_loop = running.accept_loop;
        match tokio::time::timeout(STOP_GRACE, &mut accept_loop).await {
            Ok(Ok(mut connections)) => {
                if !connections.is_empty() {
                    info!("{} open connections continue after stop", connections.len());
                }
                connections.detach_all();
            }
            Ok(Err(e)) => warn!("accept loop failed: {e}"),
            Err(_) => {
                warn!("accept loop still running after {STOP_GRACE:?}, aborting it");
                accept_loop.abort();
                let _ = accept_loop.await;
            }
        }
        info!("server stopped");
    }

    /// Replaces this server with one built from `config`, reusing the
    /// transport.
    pub async fn reload(
        mut self,
        config: Config,
        identity: Arc<dyn IdentityProvider>,
    ) -> SandboxResult<Self> {
        let mut next = Server::new(config, self.transport.clone(), identity);
        self.stop().await;
        next.start().await?;
        Ok(next)
    }
}

async fn accept_loop<T: Transport>(
    transport: Arc<T>,
    context: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = transport.accept() => match accepted {
                Ok(connection) => {
                    connections.spawn(handle_connection(context.clone(), connection));
                }
                Err(e) => {
                    warn!("failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    warn!("connection task failed: {e}");
                }
            }
        }
    }

    debug!("accept loop stopped with {} open connections", connections.len());
    connections
}

async fn handle_connection(context: Arc<ConnectionContext>, mut connection: Box<dyn Connection>) {
    let remote = connection.remote_addr();
    let login = connection.username();

    let Some(state) = authenticate(&context, connection.as_mut(), &remote, &login).await else {
        info!("closing unauthenticated connection from {remote} ({login})");
        return;
    };

    let mut session = match connection.open_session().await {
        Ok(session) => session,
        Err(e) => {
            warn!("failed to open session for {login} from {remote}: {e}");
            return;
        }
    };

    let status = context.handler.handle(&state, &mut session).await;
    if let Err(e) = connection.exit(session, status).await {
        warn!("failed to report exit status to {remote}: {e}");
    }
}

async fn authenticate(
    context: &ConnectionContext,
    connection: &mut dyn Connection,
    remote: &str,
    login: &str,
) -> Option<SessionState> {
    for _ in 0..MAX_AUTH_ATTEMPTS {
        let attempt = connection.next_auth_attempt().await?;
        match context.authenticator.authenticate(login, &attempt).await {
            Ok(state) => {
                connection.auth_result(true).await;
                return Some(state);
            }
            Err(e) => {
                error!("user {login} failed to authenticate from {remote}: {e}");
                connection.auth_result(false).await;
            }
        }
    }
    None
}
