use crate::errors::{SandboxError, SandboxResult};
use tokio::process::Command;
use tracing::debug;
use which::which;

pub fn find_binary(name: &str) -> SandboxResult<String> {
    let binary_path = which(name)
        .map_err(|_| SandboxError::MissingBinary(name.to_owned()))?
        .to_string_lossy()
        .to_string();
    Ok(binary_path)
}

/// Runs `binary` to completion and returns its stdout. A non-zero exit is a
/// `CommandFailed` carrying stderr.
pub async fn run_command(binary: &str, args: &[&str]) -> SandboxResult<String> {
    debug!("running {binary} {}", args.join(" "));
    let output = Command::new(binary).args(args).output().await?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).to_string());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(SandboxError::CommandFailed {
        command: format!("{binary} {}", args.join(" ")),
        message: stderr,
    })
}
