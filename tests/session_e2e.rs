mod common;

use chrono::Utc;
use common::{fake_runtime, have_sed, jail_config, last_profile, leftover_profiles, TestSession};
use shh_sandbox::handler::SESSION_ERROR_STATUS;
use shh_sandbox::models::{AuthMethod, PtyRequest, RemoteSignal, SessionState, UserIdentity, WindowSize};
use shh_sandbox::service::RemoteSession;
use shh_sandbox::supervisor::RUNTIME_LOG_TARGET;
use shh_sandbox::{SandboxError, SessionHandler, Supervisor};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncReadExt;

fn alice() -> SessionState {
    SessionState {
        user: UserIdentity {
            id: 42,
            username: "alice".to_string(),
            ssh_key: String::new(),
            renewed: Utc::now(),
        },
        token: "user-token".to_string(),
        direct_login: false,
        method: AuthMethod::Password,
    }
}

fn handler(dir: &Path) -> SessionHandler {
    let runtime = fake_runtime(dir);
    let supervisor = Supervisor::new(runtime.to_str().unwrap()).unwrap();
    SessionHandler::new(Arc::new(jail_config(dir)), supervisor, "/usr/bin:/bin")
}

#[tokio::test]
async fn exit_code_is_reported() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let mut test = TestSession::new("exit 7", None);
    let status = handler.handle(&alice(), &mut test.session).await;
    assert_eq!(status, 7);
    assert!(leftover_profiles(dir.path()).is_empty());
}

#[tokio::test]
async fn piped_session_forwards_output() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let mut test = TestSession::new("echo hi; echo oops >&2", None);
    let status = handler.handle(&alice(), &mut test.session).await;
    assert_eq!(status, 0);

    let (stdout, stderr) = test.output().await;
    assert_eq!(stdout, "hi\n");
    assert_eq!(stderr, "oops\n");

    let profile = last_profile(dir.path());
    assert!(profile.contains("outside_id: \"100042\""));
    assert!(profile.contains("log_fd: 3"));
    assert!(profile.contains("arg: \"alice\""));
}

#[tokio::test]
async fn pty_session_forwards_output() {
    if !have_sed() || !Path::new("/dev/ptmx").exists() {
        println!("Skipping test: sed, /bin/sh or /dev/ptmx not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let pty = PtyRequest {
        term: "xterm".to_string(),
        window: WindowSize { cols: 100, rows: 30 },
    };
    let mut test = TestSession::new("echo hi; stty size", Some(pty));
    let status = handler.handle(&alice(), &mut test.session).await;
    assert_eq!(status, 0);

    let (stdout, _) = test.output().await;
    assert!(stdout.contains("hi\r\n"), "unexpected pty output {stdout:?}");
    assert!(stdout.contains("30 100"), "unexpected pty output {stdout:?}");
}

#[tokio::test]
async fn signal_death_is_an_error() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let runtime = fake_runtime(dir.path());
    let supervisor = Supervisor::new(runtime.to_str().unwrap()).unwrap();

    let profile = shh_sandbox::render(
        &jail_config(dir.path()),
        &alice().user,
        "",
        "/usr/bin:/bin",
        "kill -KILL $$",
    )
    .await
    .unwrap();
    let mut test = TestSession::new("kill -KILL $$", None);
    let result = supervisor.run(profile.path(), &mut test.session).await;
    profile.remove().await;

    match result {
        Err(SandboxError::Terminated { signal }) => assert_eq!(signal, libc::SIGKILL),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn failed_session_reports_error_on_stderr() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let mut test = TestSession::new("kill -KILL $$", None);
    let status = handler.handle(&alice(), &mut test.session).await;
    assert_eq!(status, SESSION_ERROR_STATUS);

    let (_, stderr) = test.output().await;
    assert!(stderr.starts_with("Error: "), "unexpected stderr {stderr:?}");
    assert!(stderr.ends_with("\r\n"));
    assert!(leftover_profiles(dir.path()).is_empty());
}

#[tokio::test]
async fn remote_signals_reach_the_runtime() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let mut test = TestSession::new("sleep 30", None);
    test.events.signals.send(RemoteSignal::Term).await.unwrap();

    let status = tokio::time::timeout(
        Duration::from_secs(10),
        handler.handle(&alice(), &mut test.session),
    )
    .await
    .expect("session did not end after SIGTERM");
    assert_eq!(status, SESSION_ERROR_STATUS);
}

#[tokio::test]
async fn invalid_username_never_starts_runtime() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let mut state = alice();
    state.user.username = "../root".to_string();
    let mut test = TestSession::new("true", None);
    let status = handler.handle(&state, &mut test.session).await;
    assert_eq!(status, SESSION_ERROR_STATUS);
    assert!(!dir.path().join("last-profile.cfg").exists());
}

#[tokio::test]
async fn slow_reader_receives_all_output() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let (stdout_tx, mut stdout) = tokio::io::duplex(1024);
    let (mut session, _events) = RemoteSession::new(
        "127.0.0.1:50000",
        "head -c 60000 /dev/zero",
        None,
        Box::new(tokio::io::empty()),
        Box::new(stdout_tx),
        Box::new(tokio::io::sink()),
    );
    let reader = tokio::spawn(async move {
        let mut total = 0;
        let mut buf = [0u8; 1024];
        loop {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let n = stdout.read(&mut buf).await.unwrap();
            if n == 0 {
                return total;
            }
            total += n;
        }
    });

    let status = handler.handle(&alice(), &mut session).await;
    assert_eq!(status, 0);
    drop(session);
    assert_eq!(reader.await.unwrap(), 60000);
}

#[tokio::test]
async fn abandoned_session_releases_profile_and_output() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());
    let state = alice();

    let mut test = TestSession::new("sleep 30", None);
    let mut running = Box::pin(handler.handle(&state, &mut test.session));
    let started = async {
        while !dir.path().join("last-profile.cfg").exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::select! {
        status = &mut running => panic!("session ended early with {status}"),
        _ = tokio::time::timeout(Duration::from_secs(10), started) => {}
    }
    drop(running);

    assert!(leftover_profiles(dir.path()).is_empty());
    // aborted pumps drop the session writers, so readers see EOF
    tokio::time::timeout(Duration::from_secs(5), test.output())
        .await
        .expect("session output still held after the session was dropped");
}

#[tokio::test]
async fn resizes_reach_the_pty() {
    if !have_sed() || !Path::new("/dev/ptmx").exists() {
        println!("Skipping test: sed, /bin/sh or /dev/ptmx not found");
        return;
    }
    let dir = tempdir().unwrap();
    let handler = handler(dir.path());

    let pty = PtyRequest {
        term: "xterm".to_string(),
        window: WindowSize { cols: 80, rows: 24 },
    };
    let mut test = TestSession::new("sleep 1; stty size", Some(pty));
    test.events
        .resizes
        .send(WindowSize { cols: 132, rows: 43 })
        .await
        .unwrap();
    let status = handler.handle(&alice(), &mut test.session).await;
    assert_eq!(status, 0);

    let (stdout, _) = test.output().await;
    assert!(stdout.contains("43 132"), "unexpected pty output {stdout:?}");
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn runtime_log_lines_reach_host_log() {
    if !have_sed() {
        println!("Skipping test: sed or /bin/sh not found");
        return;
    }
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = tempdir().unwrap();
    let handler = handler(dir.path());
    let mut test = TestSession::new("true", None);
    assert_eq!(handler.handle(&alice(), &mut test.session).await, 0);

    let logs = String::from_utf8_lossy(&logs.0.lock().unwrap()).to_string();
    let line = logs
        .lines()
        .find(|line| line.contains("fake runtime starting"))
        .unwrap_or_else(|| panic!("runtime line missing from {logs:?}"));
    assert!(line.contains(RUNTIME_LOG_TARGET));
    assert!(line.contains("INFO"));
}
