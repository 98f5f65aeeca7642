//! `services`, `status` and `watch` commands.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::registry::{ServiceRegistry, ServiceStatus};

/// Two aligned columns, header first.
pub fn render_table(header: (&str, &str), rows: &[(String, String)]) -> String {
    let width = rows
        .iter()
        .map(|(name, _)| name.len())
        .chain(std::iter::once(header.0.len()))
        .max()
        .unwrap_or(0);
    let mut out = format!("{:<width$}  {}\n", header.0, header.1);
    for (name, value) in rows {
        out.push_str(&format!("{:<width$}  {}\n", name, value));
    }
    out
}

fn status_rows(statuses: &[ServiceStatus]) -> Vec<(String, String)> {
    statuses
        .iter()
        .map(|s| (s.service.clone(), s.status.clone()))
        .collect()
}

pub fn run_services_command(registry: &ServiceRegistry, json: bool) -> anyhow::Result<()> {
    let summaries = registry.summaries();
    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    let rows: Vec<(String, String)> = summaries
        .iter()
        .map(|s| {
            let mut info = format!("{} ({})", s.kind, s.container);
            if s.disabled {
                info.push_str(" [disabled]");
            }
            (s.name.clone(), info)
        })
        .collect();
    print!("{}", render_table(("SERVICE", "KIND"), &rows));
    Ok(())
}

pub async fn run_status_command(
    registry: &ServiceRegistry,
    service: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let statuses = match service {
        Some(name) => {
            let status = match registry.status_of(name).await {
                Ok(report) => ServiceStatus {
                    service: name.to_string(),
                    status: report.text,
                    detail: report.detail,
                },
                Err(e @ Error::ServiceNotFound { .. }) => return Err(e.into()),
                Err(e) => ServiceStatus {
                    service: name.to_string(),
                    status: format!("Error: {}", e),
                    detail: None,
                },
            };
            vec![status]
        }
        None => registry.get_status().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        print!("{}", render_table(("SERVICE", "STATUS"), &status_rows(&statuses)));
    }
    Ok(())
}

/// Run the event loop and print the status table every `interval` until
/// `cancel` fires. The registry must have been built with a child of
/// `cancel`.
pub async fn run_watch_command(
    registry: Arc<ServiceRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let events = registry.spawn_event_loop();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let statuses = registry.get_status().await;
                println!("{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
                print!("{}", render_table(("SERVICE", "STATUS"), &status_rows(&statuses)));
            }
        }
    }

    // The registry's token is a child of `cancel`, so the loop is ending.
    if let Err(e) = events.await {
        tracing::warn!("Event loop task failed: {}", e);
    }
    Ok(())
}
