//! Command execution gateway.
//!
//! Every external tool (`nmcli`, `iw`, `iptables`, `ip`) is invoked through a
//! [`CommandRunner`]. Arguments are always passed as a discrete vector, never
//! through a shell, and captured output is bounded so a noisy tool cannot grow
//! memory without limit.
//!
//! # Example
//!
//! ```no_run
//! use netpilot::exec::{CommandRunner, SystemRunner};
//!
//! let runner = SystemRunner::new();
//! let output = runner.run("nmcli", &["-t", "-f", "RUNNING", "general"])?;
//! println!("{}", output.stdout.trim());
//! # Ok::<(), netpilot::NetError>(())
//! ```

use std::env;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use tracing::debug;

use crate::error::{NetError, Result};
use crate::sanitize;

/// Upper bound on captured stdout; listings are parsed from it.
pub const MAX_STDOUT: usize = 64 * 1024;

/// Upper bound on captured stderr and on diagnostic text.
pub const MAX_DIAGNOSTIC: usize = 512;

/// Argument keys whose following value is a credential.
const SECRET_KEYS: &[&str] = &["password", "wifi-sec.psk", "802-11-wireless-security.psk"];

/// Exit status and bounded output of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the child was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Trimmed stderr, falling back to stdout, capped at [`MAX_DIAGNOSTIC`] bytes.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        truncate(text, MAX_DIAGNOSTIC).to_string()
    }

    /// Converts a non-zero exit into a classified [`NetError::Network`].
    ///
    /// When the tool printed nothing the error is [`NetError::SilentExit`].
    pub fn into_result(self, program: &str) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        let diagnostic = self.diagnostic();
        if diagnostic.is_empty() {
            return Err(NetError::SilentExit {
                program: program.to_string(),
                status: self.status,
            });
        }
        Err(NetError::network(diagnostic))
    }
}

/// Runs external programs.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and waits for it to exit.
    ///
    /// Spawn failures are reported as [`NetError::Spawn`]; a non-zero exit is
    /// not an error at this level and is visible in [`CommandOutput::status`].
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Whether `program` can be found, without running it.
    fn exists(&self, program: &str) -> bool;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(command = %render_command_line(program, args), "running");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| NetError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes are drained concurrently so neither can fill up and stall the child.
        let (stdout, stderr) = thread::scope(|scope| {
            let out = scope.spawn(move || read_bounded(stdout, MAX_STDOUT));
            let err = read_bounded(stderr, MAX_DIAGNOSTIC);
            (out.join().unwrap_or_default(), err)
        });

        let status = child.wait()?;
        let output = CommandOutput {
            status: status.code(),
            stdout,
            stderr,
        };

        debug!(program, status = ?output.status, "finished");
        Ok(output)
    }

    fn exists(&self, program: &str) -> bool {
        if program.contains('/') {
            return is_executable(Path::new(program));
        }
        env::var_os("PATH")
            .map(|paths| env::split_paths(&paths).any(|dir| is_executable(&dir.join(program))))
            .unwrap_or(false)
    }
}

/// Reads up to `limit` bytes and discards the rest of the stream.
fn read_bounded<R: Read>(source: Option<R>, limit: usize) -> String {
    let Some(mut source) = source else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = source.by_ref().take(limit as u64).read_to_end(&mut buf);
    let _ = io::copy(&mut source, &mut io::sink());
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Cuts `text` to at most `max` bytes on a char boundary.
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Renders a command as shell-quoted text for logs and messages.
///
/// Credential values are replaced with `***`.
pub fn render_command_line(program: &str, args: &[&str]) -> String {
    let mut rendered = vec![program.to_string()];
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            rendered.push("***".to_string());
            redact_next = false;
            continue;
        }
        redact_next = SECRET_KEYS.contains(arg);
        if sanitize::is_shell_safe(arg) {
            rendered.push(arg.to_string());
        } else {
            rendered.push(sanitize::shell_escape(arg).unwrap_or_else(|| "'...'".to_string()));
        }
    }
    rendered.join(" ")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_prefers_stderr_and_is_bounded() {
        let output = CommandOutput {
            status: Some(1),
            stdout: "ignored".to_string(),
            stderr: format!("  {}  ", "e".repeat(2000)),
        };
        assert_eq!(output.diagnostic().len(), MAX_DIAGNOSTIC);

        let output = CommandOutput {
            status: Some(1),
            stdout: "Error: from stdout\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(output.diagnostic(), "Error: from stdout");
    }

    #[test]
    fn test_into_result_classifies() {
        let output = CommandOutput {
            status: Some(4),
            stdout: String::new(),
            stderr: "Error: Connection activation failed: Secrets were required".to_string(),
        };
        let err = output.into_result("nmcli").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::AuthFailed);

        let silent = CommandOutput {
            status: Some(3),
            ..Default::default()
        };
        let err = silent.into_result("iw").unwrap_err();
        assert!(matches!(err, NetError::SilentExit { status: Some(3), .. }));
        assert!(err.to_string().contains("iw exited with status 3"));
    }

    #[test]
    fn test_render_redacts_credentials() {
        let line = render_command_line(
            "nmcli",
            &["connection", "add", "con-name", "Bob's", "wifi-sec.psk", "hunter22"],
        );
        assert!(!line.contains("hunter22"));
        assert!(line.contains("wifi-sec.psk ***"));
        assert!(line.contains("'Bob'\\''s'"));
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let text = "aé";
        assert_eq!(truncate(text, 2), "a");
        assert_eq!(truncate(text, 3), "aé");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_spawn_failure_is_distinct() {
        let runner = SystemRunner::new();
        let err = runner
            .run("/nonexistent/netpilot-test-binary", &[])
            .unwrap_err();
        assert!(matches!(err, NetError::Spawn { .. }));
        assert!(!runner.exists("/nonexistent/netpilot-test-binary"));
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_captures_exit_status() {
        let runner = SystemRunner::new();
        if !runner.exists("sh") {
            return;
        }
        let output = runner.run("sh", &["-c", "echo out; echo err >&2; exit 3"]).unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }
}
