//! # Handler Execution
//!
//! A handler is an executable file named after the handler inside the
//! function directory. It reads its payload as JSON on stdin.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::errors::{RuntimeError, RuntimeResult};
use crate::queue::FirehoseMessage;

/// Captured result of one handler run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl HandlerOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Message reported when a handler cannot be resolved
pub fn missing_handler_message(handler: &str) -> String {
    format!("This function does not export any symbol named '{}'.", handler)
}

/// Locate the executable for `handler` inside `cwd`
pub fn resolve(cwd: &Path, handler: &str) -> Option<PathBuf> {
    if handler.is_empty() || handler.contains('/') || handler == "." || handler == ".." {
        return None;
    }
    let path = cwd.join(handler);
    let metadata = std::fs::metadata(&path).ok()?;
    if !metadata.is_file() {
        return None;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return None;
        }
    }

    Some(path)
}

/// Run a handler with `input` on stdin and collect its output
pub async fn execute(path: &Path, cwd: &Path, input: &Value) -> RuntimeResult<HandlerOutput> {
    let handler = path.display().to_string();
    let io_error = |source| RuntimeError::Handler {
        handler: handler.clone(),
        source,
    };

    let mut child = Command::new(path)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(io_error)?;

    let body = serde_json::to_vec(input).unwrap_or_default();
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            // A handler that ignores its input may close stdin early.
            let _ = stdin.write_all(&body).await;
            let _ = stdin.shutdown().await;
        });
    }

    let output = child.wait_with_output().await.map_err(io_error)?;
    debug!(handler = %handler, code = ?output.status.code(), "Handler finished");

    Ok(HandlerOutput {
        code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Instruction a firehose handler prints on stdout, one JSON object per line
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum FirehoseCommand {
    Send {
        client_id: String,
        name: String,
        #[serde(default)]
        data: Value,
    },
    SendAll {
        name: String,
        #[serde(default)]
        data: Value,
    },
    Close {
        client_id: String,
    },
}

impl FirehoseCommand {
    /// Message carried by a send; data is JSON-encoded on the wire
    pub fn message(name: &str, data: &Value) -> FirehoseMessage {
        FirehoseMessage::new(name, data.to_string())
    }
}

/// Commands found in handler output. Other lines are ignored.
pub fn parse_firehose_commands(stdout: &[u8]) -> Vec<FirehoseCommand> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_script(dir: &Path, name: &str, body: &str, executable: bool) {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = if executable { 0o755 } else { 0o644 };
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }
    }

    #[test]
    fn test_resolve() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "run", "#!/bin/sh\n", true);
        write_script(dir.path(), "data.txt", "x", false);

        assert!(resolve(dir.path(), "run").is_some());
        assert!(resolve(dir.path(), "data.txt").is_none());
        assert!(resolve(dir.path(), "missing").is_none());
        assert!(resolve(dir.path(), "../run").is_none());
        assert!(resolve(dir.path(), "").is_none());
    }

    #[test]
    fn test_missing_handler_message() {
        assert_eq!(
            missing_handler_message("default"),
            "This function does not export any symbol named 'default'."
        );
    }

    #[tokio::test]
    async fn test_execute_pipes_stdin_to_stdout() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "echo", "#!/bin/sh\ncat\n", true);
        let path = resolve(dir.path(), "echo").unwrap();

        let output = execute(&path, dir.path(), &json!({"a": 1})).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, br#"{"a":1}"#.to_vec());
    }

    #[tokio::test]
    async fn test_execute_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "fail", "#!/bin/sh\necho broken >&2\nexit 3\n", true);
        let path = resolve(dir.path(), "fail").unwrap();

        let output = execute(&path, dir.path(), &Value::Null).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.code, Some(3));
        assert_eq!(String::from_utf8_lossy(&output.stderr).trim(), "broken");
    }

    #[test]
    fn test_parse_firehose_commands() {
        let stdout = b"starting\n{\"command\":\"send\",\"client_id\":\"c1\",\"name\":\"pong\",\"data\":\"x\"}\n{\"command\":\"send_all\",\"name\":\"tick\"}\n{\"command\":\"close\",\"client_id\":\"c1\"}\n{\"other\":true}\n";
        let commands = parse_firehose_commands(stdout);

        assert_eq!(commands.len(), 3);
        assert_eq!(
            commands[0],
            FirehoseCommand::Send {
                client_id: "c1".into(),
                name: "pong".into(),
                data: json!("x"),
            }
        );
        assert!(matches!(commands[1], FirehoseCommand::SendAll { ref data, .. } if data.is_null()));
        assert_eq!(
            FirehoseCommand::message("pong", &json!("x")).data,
            "\"x\""
        );
    }
}
