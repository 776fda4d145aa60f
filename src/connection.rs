use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result, bail};

use crate::ssh_config::resolver::SshClient;

/// Launch an interactive SSH session to `nickname` through `client`.
/// stdin/stdout/stderr are inherited; the session owns the terminal until
/// it exits.
pub fn connect(client: &SshClient, nickname: &str) -> Result<ExitStatus> {
    if nickname.trim().is_empty() {
        bail!("No host given");
    }
    let mut cmd = client.base_command();
    cmd.arg("--")
        .arg(nickname)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    tracing::info!("Connecting to {}", nickname);
    let status = cmd.status().with_context(|| {
        format!(
            "Failed to launch {} for '{}'",
            client.program().display(),
            nickname
        )
    })?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_nickname_rejected() {
        let client = SshClient::new("/nonexistent/sshdeck-test/ssh");
        assert!(connect(&client, " ").is_err());
    }
}
