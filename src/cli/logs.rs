//! `logs` and `exec` commands.

use std::io::Write;

use anyhow::Context;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::container::{LogSince, LogTail};
use crate::registry::ServiceRegistry;

pub async fn run_logs_command(
    registry: &ServiceRegistry,
    service: &str,
    since: &str,
    tail: &str,
    follow: bool,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if follow {
        // Following always starts from the container's start time.
        let mut lines = registry.follow_logs(service, cancel.clone())?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next() => match line {
                    Some(Ok(line)) => println!("{}", line),
                    Some(Err(e)) => {
                        tracing::warn!(service = %service, "Log stream error: {}", e);
                    }
                    None => break,
                },
            }
        }
        return Ok(());
    }

    let since = LogSince::parse(since, chrono::Utc::now()).map_err(anyhow::Error::msg)?;
    let tail = LogTail::parse(tail).map_err(anyhow::Error::msg)?;
    let lines = registry.logs(service, since, tail).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in lines {
        writeln!(out, "{}", line).context("failed to write logs")?;
    }
    Ok(())
}

/// Returns the command's exit code.
pub async fn run_exec_command(
    registry: &ServiceRegistry,
    service: &str,
    cmd: &[String],
) -> anyhow::Result<i32> {
    let output = registry.exec(service, cmd).await?;
    print!("{}", output.output);
    if !output.output.is_empty() && !output.output.ends_with('\n') {
        println!();
    }
    Ok(i32::try_from(output.exit_code).unwrap_or(1))
}
