//! External helper processes: speech synthesis, sound conversion, PBX
//! checks. All run through `sh -c`.

use std::io;
use std::process::{Output, Stdio};

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// Run `command`, feeding `input` on stdin, and collect its stdout.
pub async fn run(command: &str, input: Option<&[u8]>) -> io::Result<Output> {
    trace!(command, "Running helper");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
        let data = data.to_vec();
        // Written concurrently so a helper that fills its stdout before
        // reading all of stdin cannot deadlock us.
        tokio::spawn(async move {
            let _ = stdin.write_all(&data).await;
        });
    }
    child.wait_with_output().await
}

/// Whether `command` exits successfully. Spawn failures count as failure.
pub async fn succeeds(command: &str) -> bool {
    match run(command, None).await {
        Ok(output) => output.status.success(),
        Err(e) => {
            tracing::warn!(command, error = %e, "Helper failed to start");
            false
        }
    }
}

/// Quote `arg` for the shell.
pub fn quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_pipes_stdin_to_stdout() {
        let output = run("cat", Some(b"hello")).await.unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello");
    }

    #[tokio::test]
    async fn succeeds_reports_exit_status() {
        assert!(succeeds("true").await);
        assert!(!succeeds("exit 3").await);
    }

    #[tokio::test]
    async fn quote_survives_the_shell() {
        let tricky = "it's a $HOME `test`";
        let output = run(&format!("printf %s {}", quote(tricky)), None)
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), tricky);
    }
}
