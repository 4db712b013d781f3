//! Runs the NIC control tools through `/bin/sh -c`.
//!
//! Interface names reach the shell only through [`shellquote`].

use std::process::Stdio;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{NicError, NicResult};

pub const ETHTOOL_CMD: &str = "/usr/sbin/ethtool";
pub const IP_CMD: &str = "/sbin/ip";
pub const TC_CMD: &str = "/sbin/tc";

/// Exit status `sh` reports when the tool itself cannot be found.
const EXIT_NOT_FOUND: i32 = 127;

static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Double-quotes `s`, escaping what the shell would still expand.
pub fn shellquote(s: &str) -> String {
    format!("\"{}\"", SHELL_ESCAPE_RE.replace_all(s, r"\$1"))
}

/// Exit status and trimmed output of one tool run.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for classification and error text.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }

    /// `Some` when the tool binary was missing: the control surface is
    /// unreachable, which no caller may treat as a per-rule failure.
    pub fn missing_tool(&self) -> Option<NicError> {
        (self.exit_code == EXIT_NOT_FOUND).then(|| NicError::ShellExec {
            command: self.command.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, self.combined_output()),
        })
    }

    /// Generic failure for a non-zero exit.
    pub fn failure(&self) -> NicError {
        self.missing_tool()
            .unwrap_or_else(|| NicError::ShellCommandFailed {
                command: self.command.clone(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
    }
}

/// Runs `cmd`. Only a failure to spawn the shell is an `Err`.
pub async fn exec(cmd: &str) -> NicResult<ExecResult> {
    debug!(command = %cmd, "Executing");
    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| NicError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        command: cmd.to_string(),
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };
    if result.success() {
        trace!(command = %cmd, "Succeeded");
    } else {
        debug!(command = %cmd, exit_code = result.exit_code, stderr = %result.stderr, "Failed");
    }
    Ok(result)
}

/// Runs `cmd` and returns stdout, mapping any non-zero exit to an error.
pub async fn exec_checked(cmd: &str) -> NicResult<String> {
    let result = exec(cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(result.failure())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_neutralizes_expansion() {
        assert_eq!(shellquote("enp3s0f1v0"), "\"enp3s0f1v0\"");
        assert_eq!(shellquote("eth0$(reboot)"), "\"eth0\\$(reboot)\"");
        assert_eq!(shellquote("`id`\"\\"), "\"\\`id\\`\\\"\\\\\"");
    }

    #[tokio::test]
    async fn test_exec_checked_failure() {
        match exec_checked("echo 'rmgr: busy' >&2; exit 3").await {
            Err(NicError::ShellCommandFailed {
                exit_code, output, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(output, "rmgr: busy");
            }
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_tool_is_exec_error() {
        let result = exec("/nonexistent/ethtool -n eth0").await.unwrap();
        assert!(!result.success());
        assert!(matches!(result.missing_tool(), Some(NicError::ShellExec { .. })));
        assert!(exec("exit 1").await.unwrap().missing_tool().is_none());
    }
}
