//! Local terminal standing in for a remote client, for `shhd shell`.

use crate::errors::SandboxResult;
use crate::models::{PtyRequest, RemoteSignal, WindowSize};
use crate::service::{RemoteSession, SessionEvents};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::IsTerminal;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::debug;

pub struct RawModeGuard;

impl RawModeGuard {
    pub fn new() -> SandboxResult<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Keeps the terminal in raw mode and feeds resizes and signals into the
/// session until dropped.
pub struct Console {
    forwarders: Vec<JoinHandle<()>>,
    _raw_mode: Option<RawModeGuard>,
}

impl Drop for Console {
    fn drop(&mut self) {
        for task in &self.forwarders {
            task.abort();
        }
    }
}

pub fn current_window() -> WindowSize {
    crossterm::terminal::size()
        .map(|(cols, rows)| WindowSize { cols, rows })
        .unwrap_or_default()
}

/// Wraps this process's stdio as a session. A pty is requested when stdin
/// is a terminal.
pub fn open(command: &str) -> SandboxResult<(RemoteSession, Console)> {
    let interactive = std::io::stdin().is_terminal();
    let pty = interactive.then(|| PtyRequest {
        term: std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()),
        window: current_window(),
    });

    let (session, events) = RemoteSession::new(
        "local",
        command,
        pty,
        Box::new(tokio::io::stdin()),
        Box::new(tokio::io::stdout()),
        Box::new(tokio::io::stderr()),
    );

    let mut forwarders = Vec::new();
    let raw_mode = if interactive {
        forwarders.push(forward_resizes(events.clone())?);
        Some(RawModeGuard::new()?)
    } else {
        forwarders.push(forward_signal(events.clone(), SignalKind::interrupt(), RemoteSignal::Int)?);
        forwarders.push(forward_signal(events, SignalKind::terminate(), RemoteSignal::Term)?);
        None
    };

    Ok((
        session,
        Console {
            forwarders,
            _raw_mode: raw_mode,
        },
    ))
}

fn forward_resizes(events: SessionEvents) -> SandboxResult<JoinHandle<()>> {
    let mut sigwinch = signal(SignalKind::window_change())?;
    Ok(tokio::spawn(async move {
        while sigwinch.recv().await.is_some() {
            let size = current_window();
            if events.resizes.send(size).await.is_err() {
                break;
            }
        }
    }))
}

fn forward_signal(
    events: SessionEvents,
    kind: SignalKind,
    remote: RemoteSignal,
) -> SandboxResult<JoinHandle<()>> {
    let mut stream = signal(kind)?;
    Ok(tokio::spawn(async move {
        while stream.recv().await.is_some() {
            debug!("relaying {remote:?} to session");
            if events.signals.send(remote).await.is_err() {
                break;
            }
        }
    }))
}
