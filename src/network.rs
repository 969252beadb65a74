use crate::command::{find_binary, run_command};
use crate::config::NetworkConfig;
use crate::errors::{SandboxError, SandboxResult};
use tracing::{debug, info};

/// Linux IFNAMSIZ minus the trailing NUL.
pub const MAX_INTERFACE_NAME: usize = 15;

/// Owns the host side of sandbox networking: the veth pair and the firewall.
#[derive(Debug, Clone)]
pub struct NetworkManager {
    ip_path: String,
}

impl NetworkManager {
    pub fn new() -> SandboxResult<Self> {
        Ok(Self {
            ip_path: find_binary("ip")?,
        })
    }

    /// Recreates `<iface>-host`/`<iface>-jail`, addresses the host side and
    /// installs firewall rules. A no-op when no interface is configured.
    pub async fn setup(&self, network: &NetworkConfig) -> SandboxResult<()> {
        if !network.enabled() {
            debug!("sandbox networking disabled");
            return Ok(());
        }

        let cidr = network.cidr()?.to_string();
        let host_if = network.host_interface();
        let jail_if = network.jail_interface();
        validate_interface_name(&host_if)?;
        validate_interface_name(&jail_if)?;
        let firewall = find_binary(&network.firewall_script)?;

        self.delete_link_if_present(&host_if).await?;

        run_command(
            &self.ip_path,
            &["link", "add", &host_if, "type", "veth", "peer", "name", &jail_if],
        )
        .await?;
        run_command(&self.ip_path, &["link", "set", &host_if, "up"]).await?;
        run_command(&self.ip_path, &["addr", "add", &cidr, "dev", &host_if]).await?;
        run_command(&self.ip_path, &["link", "set", &jail_if, "up"]).await?;

        run_command(&firewall, &[&cidr]).await?;

        info!("sandbox network ready: {host_if} ({cidr}) <-> {jail_if}");
        Ok(())
    }

    pub async fn link_exists(&self, name: &str) -> SandboxResult<bool> {
        match run_command(&self.ip_path, &["link", "show", name]).await {
            Ok(_) => Ok(true),
            Err(SandboxError::CommandFailed { message, .. }) if is_missing_link(&message) => {
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    async fn delete_link_if_present(&self, name: &str) -> SandboxResult<()> {
        if !self.link_exists(name).await? {
            return Ok(());
        }

        // deleting one end removes the peer too
        match run_command(&self.ip_path, &["link", "del", name]).await {
            Ok(_) => {
                debug!("deleted stale interface {name}");
                Ok(())
            }
            Err(SandboxError::CommandFailed { message, .. }) if is_missing_link(&message) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

pub fn validate_interface_name(name: &str) -> SandboxResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME
        && !name
            .chars()
            .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control());
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidInterfaceName(name.to_string()))
    }
}

fn is_missing_link(stderr: &str) -> bool {
    stderr.contains("does not exist") || stderr.contains("Cannot find device")
}
