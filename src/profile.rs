//! nsjail profile assembly.
//!
//! A [`Profile`] is built section by section from the jail configuration and
//! the authenticated user, then serialized to protobuf text format for
//! `nsjail --config`.

use crate::addressing::NetworkAssignment;
use crate::config::JailConfig;
use crate::errors::{SandboxError, SandboxResult};
use crate::models::UserIdentity;
use serde_yaml::{Mapping, Value};
use std::fmt::{Display, Write as _};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOG_FD: i32 = 3;
pub const SU_PATH: &str = "/bin/su";
pub const LOGIN_SHELL: &str = "/usr/bin/fish";

const DEV_TMPFS_SIZE: u64 = 8 * 1024 * 1024;
const TMP_TMPFS_SIZE: u64 = 8 * 1024 * 1024;
const NSJAIL_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR", "FATAL"];

const READ_ONLY_SYSTEM_DIRS: &[(&str, bool)] = &[
    ("/lib", true),
    ("/lib64", false),
    ("/bin", true),
    ("/sbin", true),
    ("/usr", true),
];

const HOST_ETC_BINDS: &[(&str, bool)] = &[
    ("/etc/shells", true),
    ("/etc/terminfo", false),
    ("/etc/fish", true),
    ("/etc/ssl", true),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub description: String,
    pub hostname: String,
    pub cwd: String,
    pub log_level: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgroupLimits {
    pub parent: String,
    pub memory_max: u64,
    pub pids_max: u64,
    pub cpu_ms_per_sec: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdMap {
    pub inside: u32,
    pub outside: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Mount {
    pub src: Option<String>,
    pub dst: String,
    pub fstype: Option<String>,
    pub options: Option<String>,
    pub src_content: Option<String>,
    pub is_bind: bool,
    pub is_symlink: bool,
    pub rw: bool,
    pub mandatory: bool,
}

impl Mount {
    pub fn tmpfs(dst: impl Into<String>, size: u64) -> Self {
        Self {
            dst: dst.into(),
            fstype: Some("tmpfs".to_string()),
            options: Some(format!("size={size}")),
            rw: true,
            mandatory: true,
            ..Self::default()
        }
    }

    pub fn bind(src: impl Into<String>, dst: impl Into<String>, rw: bool) -> Self {
        Self {
            src: Some(src.into()),
            dst: dst.into(),
            is_bind: true,
            rw,
            mandatory: true,
            ..Self::default()
        }
    }

    pub fn proc() -> Self {
        Self {
            dst: "/proc".to_string(),
            fstype: Some("proc".to_string()),
            mandatory: true,
            ..Self::default()
        }
    }

    pub fn symlink(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: Some(src.into()),
            dst: dst.into(),
            is_symlink: true,
            mandatory: true,
            ..Self::default()
        }
    }

    pub fn content(dst: impl Into<String>, content: impl Into<String>, rw: bool) -> Self {
        Self {
            dst: dst.into(),
            src_content: Some(content.into()),
            rw,
            mandatory: true,
            ..Self::default()
        }
    }

    pub fn optional(mut self) -> Self {
        self.mandatory = false;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Macvlan {
    pub iface: String,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecBin {
    pub path: String,
    pub arg0: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub header: Header,
    pub capabilities: Vec<String>,
    pub cgroups: CgroupLimits,
    pub uid_map: IdMap,
    pub gid_map: IdMap,
    pub mounts: Vec<Mount>,
    pub seccomp: Vec<String>,
    pub network: Option<Macvlan>,
    pub exec: ExecBin,
}

/// Collects profile sections. Every section except networking is required.
#[derive(Debug, Default)]
pub struct ProfileBuilder {
    header: Option<Header>,
    capabilities: Vec<String>,
    cgroups: Option<CgroupLimits>,
    id_maps: Option<(IdMap, IdMap)>,
    mounts: Vec<Mount>,
    seccomp: Vec<String>,
    network: Option<Macvlan>,
    exec: Option<ExecBin>,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, header: Header) -> Self {
        self.header = Some(header);
        self
    }

    pub fn capability(mut self, cap: &str) -> Self {
        self.capabilities.push(cap.to_string());
        self
    }

    pub fn cgroups(mut self, limits: CgroupLimits) -> Self {
        self.cgroups = Some(limits);
        self
    }

    pub fn id_maps(mut self, uid: IdMap, gid: IdMap) -> Self {
        self.id_maps = Some((uid, gid));
        self
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn seccomp(mut self, rule: &str) -> Self {
        self.seccomp.push(rule.to_string());
        self
    }

    pub fn network(mut self, macvlan: Macvlan) -> Self {
        self.network = Some(macvlan);
        self
    }

    pub fn exec(mut self, exec: ExecBin) -> Self {
        self.exec = Some(exec);
        self
    }

    pub fn build(self) -> SandboxResult<Profile> {
        let (uid_map, gid_map) = self.id_maps.ok_or_else(|| missing("uid/gid maps"))?;
        Ok(Profile {
            header: self.header.ok_or_else(|| missing("header"))?,
            capabilities: self.capabilities,
            cgroups: self.cgroups.ok_or_else(|| missing("cgroups"))?,
            uid_map,
            gid_map,
            mounts: self.mounts,
            seccomp: self.seccomp,
            network: self.network,
            exec: self.exec.ok_or_else(|| missing("exec_bin"))?,
        })
    }
}

fn missing(section: &str) -> SandboxError {
    SandboxError::Render(format!("profile section '{section}' was never set"))
}

/// Assembles the profile for one session of `user`.
pub fn build_profile(
    config: &JailConfig,
    user: &UserIdentity,
    token: &str,
    path_var: &str,
    command: &str,
    run_id: &str,
) -> SandboxResult<Profile> {
    validate_username(&user.username)?;
    let log_level = config.log_level.to_ascii_uppercase();
    if !NSJAIL_LOG_LEVELS.contains(&log_level.as_str()) {
        return Err(SandboxError::Render(format!(
            "unknown sandbox log level '{}'",
            config.log_level
        )));
    }

    let username = user.username.as_str();
    let home = format!("/home/{username}");
    let assignment = if config.network.enabled() {
        Some(NetworkAssignment::for_user(&config.network.cidr()?, user.id)?)
    } else {
        None
    };

    let outside_uid = offset_id(config.uid_start, user.id, "uid")?;
    let outside_gid = offset_id(config.gid_start, user.id, "gid")?;

    let mut builder = ProfileBuilder::new()
        .header(Header {
            name: format!("shhd-{username}-{run_id}"),
            description: format!("restricted fish shell for {username}"),
            hostname: format!("{username}-netsoc"),
            cwd: home.clone(),
            log_level,
        })
        .capability("CAP_SETUID")
        .capability("CAP_SETGID");
    if assignment.is_some() {
        builder = builder.capability("CAP_NET_RAW");
    }

    builder = builder
        .cgroups(CgroupLimits {
            parent: config.cgroups.name.clone(),
            memory_max: config.cgroups.memory,
            pids_max: config.cgroups.pids,
            cpu_ms_per_sec: config.cgroups.cpu_time,
        })
        .id_maps(
            IdMap {
                inside: 0,
                outside: outside_uid,
            },
            IdMap {
                inside: 0,
                outside: outside_gid,
            },
        )
        .mount(Mount::tmpfs("/dev", DEV_TMPFS_SIZE));

    let tmp_dir = path_str(&config.tmp_dir)?;
    for (device, rw) in [("null", true), ("zero", true), ("random", false), ("urandom", false)] {
        builder = builder.mount(Mount::bind(
            format!("{tmp_dir}/{device}"),
            format!("/dev/{device}"),
            rw,
        ));
    }

    builder = builder
        .mount(Mount::proc())
        .mount(Mount::symlink("/proc/self/fd", "/dev/fd"));

    for &(dir, mandatory) in READ_ONLY_SYSTEM_DIRS.iter().chain(HOST_ETC_BINDS) {
        let mount = Mount::bind(dir, dir, false);
        builder = builder.mount(if mandatory { mount } else { mount.optional() });
    }

    builder = builder
        .mount(Mount::tmpfs("/tmp", TMP_TMPFS_SIZE))
        .mount(Mount::content(
            "/etc/passwd",
            format!("{username}:x:0:0::{home}:{LOGIN_SHELL}\n"),
            false,
        ))
        .mount(Mount::content(
            "/etc/group",
            format!("{username}:x:0:\n"),
            false,
        ))
        .mount(Mount::content(
            "/etc/resolv.conf",
            resolv_conf(&config.nameservers),
            false,
        ))
        .mount(Mount::content(
            "/etc/fish/config.fish",
            format!("set -gx PATH {path_var}"),
            false,
        ))
        .mount(Mount::tmpfs(home.clone(), config.home_size))
        .mount(Mount::content(
            format!("{home}/{}", config.client_config),
            client_config(config, token)?,
            true,
        ))
        .seccomp("KILL { syslog }")
        .seccomp("DEFAULT ALLOW");

    if let Some(assignment) = assignment {
        builder = builder.network(Macvlan {
            iface: config.network.jail_interface(),
            address: assignment.address,
            netmask: assignment.netmask,
            gateway: assignment.gateway,
        });
    }

    let mut args = vec!["-".to_string(), username.to_string()];
    if !command.is_empty() {
        args.push("-c".to_string());
        args.push(command.to_string());
    }

    builder
        .exec(ExecBin {
            path: SU_PATH.to_string(),
            arg0: "su".to_string(),
            args,
        })
        .build()
}

fn validate_username(username: &str) -> SandboxResult<()> {
    if username.is_empty() {
        return Err(SandboxError::Render("username is empty".to_string()));
    }
    if username == "." || username == ".." {
        return Err(SandboxError::Render(format!("invalid username '{username}'")));
    }
    if username
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err(SandboxError::Render(format!(
            "username '{}' contains forbidden characters",
            username.escape_debug()
        )));
    }
    Ok(())
}

fn offset_id(start: u32, user_id: u32, kind: &str) -> SandboxResult<u32> {
    start.checked_add(user_id).ok_or_else(|| {
        SandboxError::Render(format!("{kind} {start} + {user_id} overflows"))
    })
}

fn path_str(path: &Path) -> SandboxResult<&str> {
    path.to_str().ok_or_else(|| {
        SandboxError::Render(format!("path is not valid UTF-8: {}", path.display()))
    })
}

fn resolv_conf(nameservers: &[Ipv4Addr]) -> String {
    nameservers
        .iter()
        .map(|ns| format!("nameserver {ns}\n"))
        .collect()
}

fn client_config(config: &JailConfig, token: &str) -> SandboxResult<String> {
    let mut doc = Mapping::new();
    for (key, value) in &config.cli_extra {
        doc.insert(Value::String(key.clone()), value.clone());
    }
    doc.insert(
        Value::String("greeting".to_string()),
        Value::String(config.greeting.clone()),
    );
    doc.insert(
        Value::String("token".to_string()),
        Value::String(token.to_string()),
    );
    serde_yaml::to_string(&doc)
        .map_err(|e| SandboxError::Render(format!("failed to encode client config: {e}")))
}

impl Profile {
    pub fn to_text(&self) -> String {
        let mut w = TextWriter::default();
        let h = &self.header;
        w.string("name", &h.name);
        w.string("description", &h.description);
        w.blank();
        w.raw("mode", "ONCE");
        w.string("hostname", &h.hostname);
        w.string("cwd", &h.cwd);
        w.blank();
        w.raw("time_limit", 0);
        w.raw("daemon", false);
        w.raw("max_cpus", 1);
        w.blank();
        w.raw("log_fd", LOG_FD);
        w.raw("log_level", &h.log_level);
        w.blank();
        w.raw("keep_env", true);
        w.blank();
        for cap in &self.capabilities {
            w.string("cap", cap);
        }
        w.raw("skip_setsid", true);
        w.blank();

        let cg = &self.cgroups;
        w.string("cgroup_mem_parent", &cg.parent);
        w.string("cgroup_pids_parent", &cg.parent);
        w.string("cgroup_cpu_parent", &cg.parent);
        w.raw("cgroup_mem_max", cg.memory_max);
        w.raw("cgroup_pids_max", cg.pids_max);
        w.raw("cgroup_cpu_ms_per_sec", cg.cpu_ms_per_sec);
        w.blank();

        for (key, map) in [("uidmap", self.uid_map), ("gidmap", self.gid_map)] {
            w.block(key, |w| {
                w.string("inside_id", &map.inside.to_string());
                w.string("outside_id", &map.outside.to_string());
            });
        }
        w.blank();

        for mount in &self.mounts {
            w.block("mount", |w| write_mount(w, mount));
        }
        w.blank();

        for rule in &self.seccomp {
            w.string("seccomp_string", rule);
        }

        if let Some(net) = &self.network {
            w.blank();
            w.string("macvlan_iface", &net.iface);
            w.string("macvlan_vs_ip", &net.address.to_string());
            w.string("macvlan_vs_nm", &net.netmask.to_string());
            w.string("macvlan_vs_gw", &net.gateway.to_string());
        }
        w.blank();

        w.block("exec_bin", |w| {
            w.string("path", &self.exec.path);
            w.string("arg0", &self.exec.arg0);
            for arg in &self.exec.args {
                w.string("arg", arg);
            }
        });

        w.finish()
    }
}

fn write_mount(w: &mut TextWriter, mount: &Mount) {
    if let Some(src) = &mount.src {
        w.string("src", src);
    }
    w.string("dst", &mount.dst);
    if let Some(fstype) = &mount.fstype {
        w.string("fstype", fstype);
    }
    if let Some(options) = &mount.options {
        w.string("options", options);
    }
    if let Some(content) = &mount.src_content {
        w.string("src_content", content);
    }
    if mount.is_symlink {
        w.raw("is_symlink", true);
    } else {
        w.raw("is_bind", mount.is_bind);
        w.raw("rw", mount.rw);
    }
    if !mount.mandatory {
        w.raw("mandatory", false);
    }
}

#[derive(Default)]
struct TextWriter {
    out: String,
    depth: usize,
}

impl TextWriter {
    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn raw(&mut self, key: &str, value: impl Display) {
        self.indent();
        let _ = writeln!(self.out, "{key}: {value}");
    }

    fn string(&mut self, key: &str, value: &str) {
        self.indent();
        let _ = writeln!(self.out, "{key}: \"{}\"", escape_text(value));
    }

    fn block(&mut self, key: &str, body: impl FnOnce(&mut Self)) {
        self.indent();
        let _ = writeln!(self.out, "{key} {{");
        self.depth += 1;
        body(self);
        self.depth -= 1;
        self.indent();
        self.out.push_str("}\n");
    }

    fn blank(&mut self) {
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    fn finish(self) -> String {
        self.out
    }
}

/// Escapes a value for a double quoted protobuf text format string.
pub fn escape_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(escaped, "\\x{:02x}", c as u32);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

/// A rendered profile on disk. It holds the user's token, so the file is
/// unlinked when the handle is dropped unless [`ProfileFile::keep`] is used.
#[derive(Debug)]
pub struct ProfileFile {
    path: PathBuf,
    armed: bool,
}

impl ProfileFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.armed = false;
        if let Err(error) = tokio::fs::remove_file(&self.path).await {
            log_remove_error(&self.path, error);
        }
    }

    /// Leaves the file in place and returns its path.
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ProfileFile {
    fn drop(&mut self) {
        if self.armed {
            if let Err(error) = std::fs::remove_file(&self.path) {
                log_remove_error(&self.path, error);
            }
        }
    }
}

fn log_remove_error(path: &Path, error: std::io::Error) {
    if error.kind() != std::io::ErrorKind::NotFound {
        warn!("failed to remove profile {}: {error}", path.display());
    }
}

/// Builds the profile for a fresh session and writes it to
/// `<tmp_dir>/u<user id>-<nonce>.cfg`.
pub async fn render(
    config: &JailConfig,
    user: &UserIdentity,
    token: &str,
    path_var: &str,
    command: &str,
) -> SandboxResult<ProfileFile> {
    let mut buffer = Uuid::encode_buffer();
    let nonce = Uuid::new_v4().as_simple().encode_lower(&mut buffer).to_string();
    let profile = build_profile(config, user, token, path_var, command, &nonce)?;

    let path = config.tmp_dir.join(format!("u{}-{nonce}.cfg", user.id));
    write_profile(&path, &profile.to_text()).await?;
    debug!("rendered profile {} for {}", path.display(), user.username);
    Ok(ProfileFile { path, armed: true })
}

async fn write_profile(path: &Path, text: &str) -> SandboxResult<()> {
    let io_error = |source: std::io::Error| SandboxError::ProfileIo {
        path: path.to_path_buf(),
        source,
    };
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await
        .map_err(io_error)?;
    file.write_all(text.as_bytes()).await.map_err(io_error)?;
    file.flush().await.map_err(io_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn alice() -> UserIdentity {
        UserIdentity {
            id: 42,
            username: "alice".to_string(),
            ssh_key: String::new(),
            renewed: Utc::now(),
        }
    }

    fn networked(mut config: JailConfig) -> JailConfig {
        config.network.interface = "shh".to_string();
        config
    }

    #[test]
    fn escapes_quotes_and_control_bytes() {
        assert_eq!(escape_text(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape_text("a\\b"), "a\\\\b");
        assert_eq!(escape_text("l1\nl2\t\r"), "l1\\nl2\\t\\r");
        assert_eq!(escape_text("\u{1b}[0m"), "\\x1b[0m");
        assert_eq!(escape_text("ünï"), "ünï");
    }

    #[test]
    fn empty_command_omits_dash_c() {
        let profile =
            build_profile(&JailConfig::default(), &alice(), "tok", "/usr/bin", "", "r1").unwrap();
        assert_eq!(profile.exec.args, vec!["-", "alice"]);

        let text = profile.to_text();
        assert!(!text.contains("arg: \"-c\""));
    }

    #[test]
    fn command_is_passed_verbatim() {
        let command = r#"echo "hi" | tr a-z A-Z"#;
        let profile =
            build_profile(&JailConfig::default(), &alice(), "tok", "/usr/bin", command, "r1")
                .unwrap();
        assert_eq!(profile.exec.args, vec!["-", "alice", "-c", command]);
        assert!(profile
            .to_text()
            .contains(r#"arg: "echo \"hi\" | tr a-z A-Z""#));
    }

    #[test]
    fn maps_root_to_offset_host_ids() {
        let config = JailConfig::default();
        let profile = build_profile(&config, &alice(), "tok", "/usr/bin", "", "r1").unwrap();
        assert_eq!(profile.uid_map.inside, 0);
        assert_eq!(profile.uid_map.outside, config.uid_start + 42);
        assert_eq!(profile.gid_map.outside, config.gid_start + 42);

        let text = profile.to_text();
        assert!(text.contains("uidmap {\n  inside_id: \"0\"\n  outside_id: \"100042\"\n}"));
    }

    #[test]
    fn uid_overflow_is_a_render_error() {
        let mut config = JailConfig::default();
        config.uid_start = u32::MAX - 10;
        let err = build_profile(&config, &alice(), "tok", "/usr/bin", "", "r1").unwrap_err();
        assert!(matches!(err, SandboxError::Render(_)));
    }

    #[test]
    fn network_section_only_when_enabled() {
        let offline =
            build_profile(&JailConfig::default(), &alice(), "tok", "/usr/bin", "", "r1").unwrap();
        assert!(offline.network.is_none());
        assert!(!offline.capabilities.contains(&"CAP_NET_RAW".to_string()));
        assert!(!offline.to_text().contains("macvlan"));

        let online = build_profile(
            &networked(JailConfig::default()),
            &alice(),
            "tok",
            "/usr/bin",
            "",
            "r1",
        )
        .unwrap();
        let net = online.network.clone().unwrap();
        assert_eq!(net.iface, "shh-jail");
        assert_eq!(net.address, Ipv4Addr::new(192, 168, 0, 43));
        assert_eq!(net.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(net.gateway, Ipv4Addr::new(192, 168, 0, 1));
        assert!(online.capabilities.contains(&"CAP_NET_RAW".to_string()));

        let text = online.to_text();
        assert!(text.contains("macvlan_vs_ip: \"192.168.0.43\""));
        assert!(text.contains("macvlan_vs_gw: \"192.168.0.1\""));
    }

    #[test]
    fn synthesizes_identity_files_and_client_config() {
        let mut config = JailConfig::default();
        config.greeting = "hello there\n".to_string();
        let profile = build_profile(&config, &alice(), "secret-token", "/usr/bin:/bin", "", "r1")
            .unwrap();
        let content = |dst: &str| {
            profile
                .mounts
                .iter()
                .find(|m| m.dst == dst)
                .and_then(|m| m.src_content.clone())
                .unwrap()
        };

        assert_eq!(
            content("/etc/passwd"),
            "alice:x:0:0::/home/alice:/usr/bin/fish\n"
        );
        assert_eq!(content("/etc/group"), "alice:x:0:\n");
        assert_eq!(
            content("/etc/resolv.conf"),
            "nameserver 1.1.1.1\nnameserver 1.0.0.1\n"
        );
        assert_eq!(
            content("/etc/fish/config.fish"),
            "set -gx PATH /usr/bin:/bin"
        );

        let client: serde_yaml::Mapping =
            serde_yaml::from_str(&content("/home/alice/.netsoc.yaml")).unwrap();
        assert_eq!(
            client.get("token").and_then(|v| v.as_str()),
            Some("secret-token")
        );
        assert_eq!(
            client.get("greeting").and_then(|v| v.as_str()),
            Some("hello there\n")
        );
        assert_eq!(
            client.get("last_update_check").and_then(|v| v.as_str()),
            Some("9999-12-31T23:59:59Z")
        );
    }

    #[test]
    fn mounts_devices_and_system_dirs() {
        let profile =
            build_profile(&JailConfig::default(), &alice(), "tok", "/usr/bin", "", "r1").unwrap();
        let find = |dst: &str| profile.mounts.iter().find(|m| m.dst == dst).unwrap();

        assert_eq!(find("/dev").fstype.as_deref(), Some("tmpfs"));
        assert_eq!(find("/dev/null").src.as_deref(), Some("/tmp/shh/null"));
        assert!(find("/dev/null").rw);
        assert!(!find("/dev/urandom").rw);
        assert!(!find("/usr").rw);
        assert!(!find("/lib64").mandatory);
        assert!(find("/dev/fd").is_symlink);
        assert_eq!(
            find("/home/alice").options.as_deref(),
            Some("size=33554432")
        );

        let text = profile.to_text();
        assert!(text.contains("mode: ONCE\n"));
        assert!(text.contains("log_level: WARNING\n"));
        assert!(text.contains("hostname: \"alice-netsoc\"\n"));
        assert!(text.contains("cgroup_mem_max: 134217728\n"));
        assert!(text.contains("seccomp_string: \"KILL { syslog }\"\n"));
    }

    #[test]
    fn rejects_hostile_usernames_and_levels() {
        let mut user = alice();
        for name in ["", "..", "a/b", "a b", "a:b", "a\nb"] {
            user.username = name.to_string();
            assert!(
                build_profile(&JailConfig::default(), &user, "t", "/bin", "", "r1").is_err(),
                "accepted {name:?}"
            );
        }

        let mut config = JailConfig::default();
        config.log_level = "LOUD\ncap: \"CAP_SYS_ADMIN\"".to_string();
        assert!(build_profile(&config, &alice(), "t", "/bin", "", "r1").is_err());
    }

    #[test]
    fn builder_requires_core_sections() {
        let err = ProfileBuilder::new().capability("CAP_SETUID").build().unwrap_err();
        assert!(matches!(err, SandboxError::Render(_)));
    }

    #[tokio::test]
    async fn render_writes_a_fresh_file_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JailConfig::default();
        config.tmp_dir = dir.path().to_path_buf();

        let first = render(&config, &alice(), "tok", "/usr/bin", "echo hi")
            .await
            .unwrap();
        let second = render(&config, &alice(), "tok", "/usr/bin", "")
            .await
            .unwrap();
        assert_ne!(first.path(), second.path());

        let name = first.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("u42-") && name.ends_with(".cfg"));

        let text = tokio::fs::read_to_string(first.path()).await.unwrap();
        assert!(text.contains("arg: \"echo hi\""));

        let path = first.path().to_path_buf();
        first.remove().await;
        assert!(!path.exists());
        second.remove().await;
    }

    #[tokio::test]
    async fn dropped_profile_is_unlinked_unless_kept() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = JailConfig::default();
        config.tmp_dir = dir.path().to_path_buf();

        let dropped = render(&config, &alice(), "tok", "/usr/bin", "").await.unwrap();
        let dropped_path = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!dropped_path.exists());

        let kept = render(&config, &alice(), "tok", "/usr/bin", "").await.unwrap();
        let kept_path = kept.keep();
        assert!(kept_path.exists());
    }

    #[tokio::test]
    async fn render_reports_unwritable_directory() {
        let mut config = JailConfig::default();
        config.tmp_dir = PathBuf::from("/nonexistent/shh-profile-dir");
        let err = render(&config, &alice(), "tok", "/usr/bin", "")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::ProfileIo { .. }));
    }
}
