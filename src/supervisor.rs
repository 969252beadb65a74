use crate::command::find_binary;
use crate::errors::{SandboxError, SandboxResult};
use crate::models::{PtyRequest, RemoteSignal, WindowSize};
use crate::profile::LOG_FD;
use crate::pty::{self, PtyMaster};
use crate::service::{BoxedReader, BoxedWriter, RemoteSession};
use futures::future::join_all;
use nix::fcntl::OFlag;
use nix::sys::signal::kill;
use nix::unistd::{pipe2, Pid};
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

pub const RUNTIME_LOG_TARGET: &str = "shhd::runtime";

/// Once the child has exited, an output stream that stays silent this long
/// is considered held open by a leftover descendant and is closed.
const DRAIN_IDLE: Duration = Duration::from_millis(500);
const PUMP_BUFFER: usize = 8 * 1024;

/// Launches the sandbox runtime for one session and bridges its I/O.
#[derive(Debug, Clone)]
pub struct Supervisor {
    runtime: String,
}

impl Supervisor {
    pub fn new(runtime: &str) -> SandboxResult<Self> {
        Ok(Self {
            runtime: find_binary(runtime)?,
        })
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Runs `<runtime> --config <profile>` until it exits and returns its
    /// exit code. A child killed by a signal yields `Terminated`.
    ///
    /// The session's output writers are handed back once drained, so the
    /// caller can still report errors on them.
    pub async fn run(&self, profile: &Path, session: &mut RemoteSession) -> SandboxResult<u32> {
        let (log_rx, log_tx) = pipe2(OFlag::O_CLOEXEC)?;

        let mut command = Command::new(&self.runtime);
        command
            .arg("--config")
            .arg(profile)
            .env_clear()
            .kill_on_drop(true);
        install_log_fd(&mut command, &log_tx);

        let mut tasks = SessionTasks::new();
        let mut child = match session.pty.clone() {
            Some(request) => {
                let (child, master) = spawn_with_pty(command, &request)?;
                tasks.start_pty(master, session);
                child
            }
            None => {
                let mut child = spawn_with_pipes(command)?;
                tasks.start_pipes(&mut child, session);
                child
            }
        };
        drop(log_tx);

        let pid = child.id();
        info!(
            "sandbox runtime started (pid {}) for {}",
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            session.remote_addr
        );
        tasks.start_log_pump(log_rx);
        tasks.start_signal_relay(pid, detach(&mut session.signals));

        let status = child.wait().await;
        tasks.finish(session).await;

        exit_code(status?)
    }
}

fn install_log_fd(command: &mut Command, log_tx: &OwnedFd) {
    let fd = log_tx.as_raw_fd();
    unsafe {
        command.pre_exec(move || {
            if fd == LOG_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(fd, LOG_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

fn spawn_with_pty(mut command: Command, request: &PtyRequest) -> SandboxResult<(Child, PtyMaster)> {
    let (master, slave) = pty::open(request.window)?;
    command
        .env("TERM", &request.term)
        .stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(SandboxError::Spawn)?;
    // the command still owns copies of the slave
    drop(command);
    Ok((child, master))
}

fn spawn_with_pipes(mut command: Command) -> SandboxResult<Child> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command.spawn().map_err(SandboxError::Spawn)
}

fn exit_code(status: ExitStatus) -> SandboxResult<u32> {
    match status.code() {
        Some(code) => {
            debug!("sandbox runtime exited with {code}");
            u32::try_from(code)
                .map_err(|_| SandboxError::Internal(format!("unexpected exit code {code}")))
        }
        None => Err(SandboxError::Terminated {
            signal: status.signal().unwrap_or(libc::SIGKILL),
        }),
    }
}

fn detach<T>(receiver: &mut mpsc::Receiver<T>) -> mpsc::Receiver<T> {
    std::mem::replace(receiver, mpsc::channel(1).1)
}

fn take_reader(session: &mut RemoteSession) -> BoxedReader {
    std::mem::replace(&mut session.stdin, Box::new(tokio::io::empty()))
}

fn take_writer(writer: &mut BoxedWriter) -> BoxedWriter {
    std::mem::replace(writer, Box::new(tokio::io::sink()))
}

/// Forwarding tasks of one session. Input-side tasks are aborted when the
/// child exits. Output pumps run until their source reaches EOF or goes idle
/// for [`DRAIN_IDLE`]. Dropping the set aborts whatever is still running.
struct SessionTasks {
    exited: watch::Sender<bool>,
    input: Vec<JoinHandle<()>>,
    stdout: Option<JoinHandle<BoxedWriter>>,
    stderr: Option<JoinHandle<BoxedWriter>>,
    log: Option<JoinHandle<()>>,
}

impl SessionTasks {
    fn new() -> Self {
        Self {
            exited: watch::channel(false).0,
            input: Vec::new(),
            stdout: None,
            stderr: None,
            log: None,
        }
    }

    fn start_pty(&mut self, master: PtyMaster, session: &mut RemoteSession) {
        let mut stdin = take_reader(session);
        let mut pty_in = master.clone();
        self.input.push(tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin, &mut pty_in).await {
                debug!("pty input closed: {e}");
            }
        }));

        let stdout = take_writer(&mut session.stdout);
        self.stdout = Some(tokio::spawn(pump(
            master.clone(),
            stdout,
            self.exited.subscribe(),
        )));

        let mut resizes = detach(&mut session.resizes);
        self.input.push(tokio::spawn(async move {
            while let Some(size) = resizes.recv().await {
                apply_resize(&master, size);
            }
        }));
    }

    fn start_pipes(&mut self, child: &mut Child, session: &mut RemoteSession) {
        if let Some(mut child_stdin) = child.stdin.take() {
            let mut stdin = take_reader(session);
            self.input.push(tokio::spawn(async move {
                if let Err(e) = tokio::io::copy(&mut stdin, &mut child_stdin).await {
                    debug!("stdin pipe closed: {e}");
                }
                // dropping child_stdin delivers EOF
                let _ = child_stdin.shutdown().await;
            }));
        }
        if let Some(child_stdout) = child.stdout.take() {
            let stdout = take_writer(&mut session.stdout);
            self.stdout = Some(tokio::spawn(pump(
                child_stdout,
                stdout,
                self.exited.subscribe(),
            )));
        }
        if let Some(child_stderr) = child.stderr.take() {
            let stderr = take_writer(&mut session.stderr);
            self.stderr = Some(tokio::spawn(pump(
                child_stderr,
                stderr,
                self.exited.subscribe(),
            )));
        }
    }

    fn start_log_pump(&mut self, log_rx: OwnedFd) {
        let receiver = match pipe::Receiver::from_owned_fd(log_rx) {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("failed to attach runtime log pipe: {e}");
                return;
            }
        };
        let mut exited = self.exited.subscribe();
        self.log = Some(tokio::spawn(async move {
            let mut lines = BufReader::new(receiver).lines();
            loop {
                match until_idle(lines.next_line(), &mut exited).await {
                    Some(Ok(Some(line))) => log_runtime_line(&line),
                    Some(Ok(None)) => break,
                    Some(Err(e)) => {
                        debug!("runtime log pipe error: {e}");
                        break;
                    }
                    None => {
                        debug!("runtime log pipe idle after exit, closing");
                        break;
                    }
                }
            }
        }));
    }

    fn start_signal_relay(&mut self, pid: Option<u32>, mut signals: mpsc::Receiver<RemoteSignal>) {
        let pid = pid.and_then(|p| i32::try_from(p).ok()).map(Pid::from_raw);
        self.input.push(tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let Some(pid) = pid else {
                    continue;
                };
                let os_signal = signal.to_os();
                trace!("forwarding {os_signal} to {pid}");
                if let Err(e) = kill(pid, os_signal) {
                    warn!("failed to forward {os_signal} to {pid}: {e}");
                }
            }
        }));
    }

    async fn finish(mut self, session: &mut RemoteSession) {
        self.exited.send_replace(true);
        for task in &self.input {
            task.abort();
        }

        if let Some(stdout) = self.stdout.take() {
            if let Some(writer) = join(stdout).await {
                session.stdout = writer;
            }
        }
        if let Some(stderr) = self.stderr.take() {
            if let Some(writer) = join(stderr).await {
                session.stderr = writer;
            }
        }
        if let Some(log) = self.log.take() {
            join(log).await;
        }

        join_all(self.input.drain(..)).await;
    }
}

impl Drop for SessionTasks {
    fn drop(&mut self) {
        for task in &self.input {
            task.abort();
        }
        if let Some(stdout) = &self.stdout {
            stdout.abort();
        }
        if let Some(stderr) = &self.stderr {
            stderr.abort();
        }
        if let Some(log) = &self.log {
            log.abort();
        }
    }
}

/// Copies `reader` into `writer` until EOF. Writes are never timed out, so a
/// slow client still receives everything.
async fn pump<R>(
    mut reader: R,
    mut writer: BoxedWriter,
    mut exited: watch::Receiver<bool>,
) -> BoxedWriter
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; PUMP_BUFFER];
    loop {
        let read = match until_idle(reader.read(&mut buffer), &mut exited).await {
            Some(read) => read,
            None => {
                debug!("session output idle for {DRAIN_IDLE:?} after exit, closing");
                break;
            }
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).await {
                    debug!("output pump stopped: {e}");
                    break;
                }
            }
            Err(e) => {
                debug!("output pump stopped: {e}");
                break;
            }
        }
    }
    if let Err(e) = writer.flush().await {
        debug!("failed to flush session output: {e}");
    }
    writer
}

/// Waits for `next`. While the child runs there is no limit; after it has
/// exited, gives up once `next` stays pending for [`DRAIN_IDLE`].
async fn until_idle<F: Future>(next: F, exited: &mut watch::Receiver<bool>) -> Option<F::Output> {
    tokio::pin!(next);
    let running = !*exited.borrow();
    if running {
        tokio::select! {
            output = &mut next => return Some(output),
            _ = exited.changed() => {}
        }
    }
    tokio::time::timeout(DRAIN_IDLE, next).await.ok()
}

async fn join<T>(handle: JoinHandle<T>) -> Option<T> {
    match handle.await {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("forwarding task failed: {e}");
            None
        }
    }
}

fn apply_resize(master: &PtyMaster, size: WindowSize) {
    if let Err(e) = master.resize(size) {
        warn!("failed to resize pty to {}x{}: {e}", size.cols, size.rows);
    }
}

/// Re-emits one nsjail log line, keeping its severity.
fn log_runtime_line(line: &str) {
    match runtime_line_level(line) {
        RuntimeLevel::Error => error!(target: RUNTIME_LOG_TARGET, "{line}"),
        RuntimeLevel::Warn => warn!(target: RUNTIME_LOG_TARGET, "{line}"),
        RuntimeLevel::Info => info!(target: RUNTIME_LOG_TARGET, "{line}"),
        RuntimeLevel::Debug => debug!(target: RUNTIME_LOG_TARGET, "{line}"),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RuntimeLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn runtime_line_level(line: &str) -> RuntimeLevel {
    match line.as_bytes() {
        [b'[', b'E' | b'F', ..] => RuntimeLevel::Error,
        [b'[', b'W', ..] => RuntimeLevel::Warn,
        [b'[', b'D', ..] => RuntimeLevel::Debug,
        _ => RuntimeLevel::Info,
    }
}
