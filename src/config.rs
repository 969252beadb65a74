use crate::addressing::Ipv4Cidr;
use crate::errors::{SandboxError, SandboxResult};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_PREFIX: &str = "SHHD";
/// `SHHD_*` variables consumed by the command line instead of the config.
pub const CLI_ENV_VARS: &[&str] = &["SHHD_CONFIG_FILE", "SHHD_LOG_DIR"];
pub const CONFIG_FILE_NAME: &str = "shhd.yaml";
pub const CONFIG_SEARCH_PATHS: &[&str] = &["/run/config", "."];

const REDACTED: &str = "<redacted>";

const DEFAULT_GREETING: &str = "Welcome to Netsoc SHH (not a typo :P).
The latest version of the CLI is pre-installed (type netsoc).

For more information, see https://docs.netsoc.ie.
";

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub log_level: String,
    pub iam: IamConfig,
    pub ssh: SshConfig,
    pub jail: JailConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IamConfig {
    pub url: String,
    pub token: String,
    pub token_file: Option<PathBuf>,
    pub allow_insecure: bool,
    /// Seconds a renewal stays valid for public key logins.
    pub login_validity: u64,
}

impl IamConfig {
    pub fn login_validity(&self) -> Duration {
        Duration::from_secs(self.login_validity)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    pub listen_address: String,
    /// Inline OpenSSH private keys.
    pub host_keys: Vec<String>,
    pub host_key_files: Vec<PathBuf>,
}

impl SshConfig {
    pub fn parsed_host_keys(&self) -> SandboxResult<Vec<ssh_key::PrivateKey>> {
        self.host_keys
            .iter()
            .enumerate()
            .map(|(index, pem)| {
                ssh_key::PrivateKey::from_openssh(pem).map_err(|e| {
                    SandboxError::Config(format!("failed to parse SSH host key #{index}: {e}"))
                })
            })
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct JailConfig {
    pub tmp_dir: PathBuf,
    /// Verbosity passed through to the sandbox runtime.
    pub log_level: String,
    pub uid_start: u32,
    pub gid_start: u32,
    pub cgroups: CgroupConfig,
    pub home_size: u64,
    pub greeting: String,
    pub cli_extra: BTreeMap<String, serde_yaml::Value>,
    /// File name of the client config placed in the user's home.
    pub client_config: String,
    pub nameservers: Vec<Ipv4Addr>,
    /// Sandbox runtime executable, resolved through PATH.
    pub runtime: String,
    pub network: NetworkConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CgroupConfig {
    pub root: PathBuf,
    pub name: String,
    pub memory: u64,
    pub pids: u64,
    pub cpu_time: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Base name of the veth pair. Empty disables sandbox networking.
    pub interface: String,
    /// Host side address and prefix, e.g. `192.168.0.1/16`.
    pub address: String,
    pub firewall_script: String,
}

impl NetworkConfig {
    pub fn enabled(&self) -> bool {
        !self.interface.is_empty()
    }

    pub fn host_interface(&self) -> String {
        format!("{}-host", self.interface)
    }

    pub fn jail_interface(&self) -> String {
        format!("{}-jail", self.interface)
    }

    pub fn cidr(&self) -> SandboxResult<Ipv4Cidr> {
        self.address.parse()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            iam: IamConfig {
                url: "https://iam.netsoc.ie/v1".to_string(),
                token: String::new(),
                token_file: None,
                allow_insecure: false,
                login_validity: 365 * 24 * 60 * 60,
            },
            ssh: SshConfig {
                listen_address: ":22".to_string(),
                host_keys: Vec::new(),
                host_key_files: Vec::new(),
            },
            jail: JailConfig::default(),
        }
    }
}

impl Default for JailConfig {
    fn default() -> Self {
        let mut cli_extra = BTreeMap::new();
        cli_extra.insert(
            "last_update_check".to_string(),
            serde_yaml::Value::String("9999-12-31T23:59:59Z".to_string()),
        );

        Self {
            tmp_dir: PathBuf::from("/tmp/shh"),
            log_level: "WARNING".to_string(),
            uid_start: 100_000,
            gid_start: 100_000,
            cgroups: CgroupConfig {
                root: PathBuf::from("/sys/fs/cgroup"),
                name: "shh".to_string(),
                memory: 128 * 1024 * 1024,
                pids: 64,
                cpu_time: 200,
            },
            home_size: 32 * 1024 * 1024,
            greeting: DEFAULT_GREETING.to_string(),
            cli_extra,
            client_config: ".netsoc.yaml".to_string(),
            nameservers: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(1, 0, 0, 1)],
            runtime: "nsjail".to_string(),
            network: NetworkConfig {
                interface: String::new(),
                address: "192.168.0.1/16".to_string(),
                firewall_script: "firewall.sh".to_string(),
            },
        }
    }
}

impl Config {
    /// Layers defaults, the YAML file, `SHHD_*` environment variables and the
    /// command line log level, in that order.
    pub fn load(file: Option<&Path>, log_level: Option<&str>) -> SandboxResult<Self> {
        Self::load_with_env(file, log_level, environment(std::env::vars()))
    }

    pub fn load_with_env(
        file: Option<&Path>,
        log_level: Option<&str>,
        env: Environment,
    ) -> SandboxResult<Self> {
        let defaults = config::Config::try_from(&Config::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);

        match file {
            Some(path) => {
                builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
            }
            None => {
                if let Some(found) = locate_config_file() {
                    debug!("using config file {}", found.display());
                    builder = builder.add_source(File::from(found).format(FileFormat::Yaml));
                }
            }
        }

        let built = builder
            .add_source(env)
            .set_override_option("log_level", log_level.map(str::to_string))
            .map_err(config_error)?
            .build()
            .map_err(config_error)?;

        let config: Config = built.try_deserialize().map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.jail.cgroups.name.is_empty() || self.jail.cgroups.name.contains('/') {
            return Err(SandboxError::Config(format!(
                "invalid cgroup name '{}'",
                self.jail.cgroups.name
            )));
        }
        if self.jail.client_config.is_empty() || self.jail.client_config.contains('/') {
            return Err(SandboxError::Config(format!(
                "invalid client config file name '{}'",
                self.jail.client_config
            )));
        }
        if self.jail.network.enabled() {
            self.jail.network.cidr()?;
        }
        Ok(())
    }

    /// Loads secret values referenced by path and checks every host key parses.
    pub fn read_secrets(&mut self) -> SandboxResult<()> {
        if let Some(path) = &self.iam.token_file {
            let token = std::fs::read_to_string(path).map_err(|e| {
                SandboxError::Config(format!(
                    "failed to read IAM token file {}: {e}",
                    path.display()
                ))
            })?;
            self.iam.token = token.trim().to_string();
        }

        for path in &self.ssh.host_key_files {
            let data = std::fs::read_to_string(path).map_err(|e| {
                SandboxError::Config(format!(
                    "failed to read SSH host key file {}: {e}",
                    path.display()
                ))
            })?;
            ssh_key::PrivateKey::from_openssh(&data).map_err(|e| {
                SandboxError::Config(format!(
                    "failed to parse SSH host key file {}: {e}",
                    path.display()
                ))
            })?;
            self.ssh.host_keys.push(data);
        }

        self.ssh.parsed_host_keys()?;
        Ok(())
    }

    /// Copy safe to log: tokens and private keys are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.iam.token.is_empty() {
            copy.iam.token = REDACTED.to_string();
        }
        copy.ssh.host_keys = copy
            .ssh
            .host_keys
            .iter()
            .map(|_| REDACTED.to_string())
            .collect();
        copy
    }
}

fn locate_config_file() -> Option<PathBuf> {
    CONFIG_SEARCH_PATHS
        .iter()
        .map(|dir| Path::new(dir).join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// The `SHHD_*` environment layer over `vars`, without [`CLI_ENV_VARS`].
pub fn environment(vars: impl IntoIterator<Item = (String, String)>) -> Environment {
    let vars: config::Map<String, String> = vars
        .into_iter()
        .filter(|(key, _)| !CLI_ENV_VARS.contains(&key.as_str()))
        .collect();
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .source(Some(vars))
}

fn config_error(error: config::ConfigError) -> SandboxError {
    SandboxError::Config(error.to_string())
}
