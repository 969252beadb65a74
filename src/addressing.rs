use crate::errors::{SandboxError, SandboxResult};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 address together with its prefix length, e.g. `192.168.0.1/16`.
/// The address keeps its host bits; it is the host side of the veth pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.netmask_bits())
    }

    /// Host portion of the network, i.e. the complement of the netmask.
    pub fn host_mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(!self.netmask_bits())
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.netmask_bits())
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !self.netmask_bits())
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & self.netmask_bits() == u32::from(self.network())
    }

    fn netmask_bits(&self) -> u32 {
        match self.prefix {
            0 => 0,
            prefix => u32::MAX << (32 - u32::from(prefix)),
        }
    }
}

impl FromStr for Ipv4Cidr {
    type Err = SandboxError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (address, prefix) = value
            .trim()
            .split_once('/')
            .ok_or_else(|| SandboxError::Config(format!("'{value}' is not in CIDR notation")))?;
        let address: Ipv4Addr = address
            .parse()
            .map_err(|e| SandboxError::Config(format!("invalid address in '{value}': {e}")))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| SandboxError::Config(format!("invalid prefix in '{value}': {e}")))?;
        if prefix > 32 {
            return Err(SandboxError::Config(format!(
                "prefix length {prefix} in '{value}' exceeds 32"
            )));
        }
        Ok(Self { address, prefix })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

/// Per-user sandbox addressing derived from the configured base network.
/// User ids start at 1; id 0 would collide with the host side of the link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkAssignment {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub host_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl NetworkAssignment {
    pub fn for_user(base: &Ipv4Cidr, user_id: u32) -> SandboxResult<Self> {
        let host_mask = base.host_mask();
        if user_id > u32::from(host_mask) {
            return Err(SandboxError::Render(format!(
                "user id {user_id} does not fit in the host range of {base}"
            )));
        }

        let address = ip_from_offset(base.address, user_id)?;
        if !base.contains(address) {
            return Err(SandboxError::Render(format!(
                "address {address} for user id {user_id} falls outside {base}"
            )));
        }
        if address == base.address || address == base.network() || address == base.broadcast() {
            return Err(SandboxError::Render(format!(
                "address {address} for user id {user_id} is reserved in {base}"
            )));
        }

        Ok(Self {
            address,
            netmask: base.netmask(),
            host_mask,
            gateway: base.address,
        })
    }
}

fn ip_from_offset(base: Ipv4Addr, offset: u32) -> SandboxResult<Ipv4Addr> {
    let base_value = u32::from_be_bytes(base.octets());
    let combined = base_value
        .checked_add(offset)
        .ok_or_else(|| SandboxError::Render(format!("{base} + {offset} overflows IPv4")))?;
    Ok(Ipv4Addr::from(combined))
}
