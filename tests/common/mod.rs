#![allow(dead_code)]

use shh_sandbox::config::{Config, JailConfig};
use shh_sandbox::models::PtyRequest;
use shh_sandbox::service::{RemoteSession, SessionEvents};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tokio::io::{AsyncReadExt, DuplexStream};

/// Stands in for nsjail: keeps a copy of the profile it was given, logs a
/// line on fd 3 (exiting with 97 when fd 3 is not open) and runs the `-c`
/// command from the profile's exec block.
const FAKE_RUNTIME: &str = r#"#!/bin/sh
PATH=/usr/bin:/bin
cp "$2" "$(dirname "$0")/last-profile.cfg"
echo "[I] fake runtime starting" >&3 || exit 97
cmd=$(sed -n '/arg: "-c"/{n;s/^ *arg: "\(.*\)"$/\1/p;}' "$2")
[ -n "$cmd" ] || cmd=true
exec /bin/sh -c "$cmd"
"#;

pub fn is_root() -> bool {
    Command::new("id")
        .arg("-u")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false)
}

pub fn have_sed() -> bool {
    which::which("sed").is_ok() && Path::new("/bin/sh").exists()
}

/// Writes the fake runtime into `dir` and returns its path.
pub fn fake_runtime(dir: &Path) -> PathBuf {
    let path = dir.join("fake-nsjail");
    std::fs::write(&path, FAKE_RUNTIME).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// The profile most recently handed to the fake runtime in `dir`.
pub fn last_profile(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("last-profile.cfg")).unwrap()
}

pub fn jail_config(tmp_dir: &Path) -> JailConfig {
    let mut jail = Config::default().jail;
    jail.tmp_dir = tmp_dir.to_path_buf();
    jail
}

/// Rendered profiles left behind in `dir`.
pub fn leftover_profiles(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with('u') && name.ends_with(".cfg"))
        })
        .collect()
}

/// A session whose output can be read back once it is dropped.
pub struct TestSession {
    pub session: RemoteSession,
    pub events: SessionEvents,
    stdout: DuplexStream,
    stderr: DuplexStream,
}

impl TestSession {
    pub fn new(command: &str, pty: Option<PtyRequest>) -> Self {
        let (stdout_tx, stdout) = tokio::io::duplex(64 * 1024);
        let (stderr_tx, stderr) = tokio::io::duplex(64 * 1024);
        let (session, events) = RemoteSession::new(
            "127.0.0.1:50000",
            command,
            pty,
            Box::new(tokio::io::empty()),
            Box::new(stdout_tx),
            Box::new(stderr_tx),
        );
        Self {
            session,
            events,
            stdout,
            stderr,
        }
    }

    /// Drops the session and returns everything written to stdout and stderr.
    pub async fn output(self) -> (String, String) {
        let Self {
            session,
            events,
            mut stdout,
            mut stderr,
        } = self;
        drop(session);
        drop(events);

        let mut out = Vec::new();
        let mut err = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        stderr.read_to_end(&mut err).await.unwrap();
        (
            String::from_utf8_lossy(&out).to_string(),
            String::from_utf8_lossy(&err).to_string(),
        )
    }
}
