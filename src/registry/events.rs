//! Container event dispatch loop.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::container::ContainerRuntime;
use crate::registry::ServiceRegistry;

/// First back-off after the event stream fails.
pub const EVENT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Back-off ceiling between resubscriptions.
pub const EVENT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Subscribe, dispatch, and resubscribe on failure until cancelled.
///
/// Every successful subscription is followed by a refresh of all services,
/// so events missed while disconnected are reconciled.
pub(crate) async fn run(
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    cancel: CancellationToken,
) {
    let mut backoff = EVENT_BACKOFF_INITIAL;
    tracing::info!("Event loop started");

    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => break,
            res = runtime.events() => res,
        };

        match subscribed {
            Ok(mut events) => {
                registry.refresh_all().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            tracing::info!("Event loop stopped");
                            return;
                        }
                        item = events.next() => match item {
                            Some(Ok(event)) => {
                                backoff = EVENT_BACKOFF_INITIAL;
                                tracing::debug!(
                                    container = event.container_name.as_deref().unwrap_or(&event.container_id),
                                    kind = ?event.kind,
                                    "Container event"
                                );
                                registry.dispatch(&event).await;
                            }
                            Some(Err(e)) => {
                                tracing::warn!("Event stream error: {}", e);
                                break;
                            }
                            None => {
                                tracing::warn!("Event stream ended");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to subscribe to container events: {}", e);
            }
        }

        tracing::info!("Resubscribing to container events in {:?}", backoff);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(EVENT_BACKOFF_MAX);
    }

    tracing::info!("Event loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::container::{EventKind, LifecycleState};
    use crate::registry::ServiceRegistry;
    use crate::service::{ServiceDescriptor, ServiceKind, ServiceOptions};
    use crate::testing::FakeRuntime;

    use super::*;

    fn build(runtime: &Arc<FakeRuntime>, cancel: &CancellationToken) -> Arc<ServiceRegistry> {
        let descriptors = vec![ServiceDescriptor::new(
            "webui",
            "testnet_webui_1",
            ServiceKind::Webui,
        )];
        Arc::new(
            ServiceRegistry::build(
                descriptors,
                runtime.clone(),
                &ServiceOptions::default(),
                Duration::from_secs(10),
                cancel.clone(),
            )
            .unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_update_snapshots() {
        let runtime = Arc::new(FakeRuntime::new());
        let cancel = CancellationToken::new();
        let registry = build(&runtime, &cancel);
        let task = registry.spawn_event_loop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let webui = registry.get_service("webui").unwrap();
        assert!(webui.container().snapshot().is_none());

        runtime.add_container("testnet_webui_1", LifecycleState::Running, &[]);
        runtime.emit("testnet_webui_1", EventKind::Start);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            webui.container().snapshot().unwrap().state,
            LifecycleState::Running
        );

        runtime.emit("testnet_webui_1", EventKind::Destroy);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(webui.container().snapshot().is_none());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_with_backoff_and_reconciles() {
        let runtime = Arc::new(FakeRuntime::new());
        let cancel = CancellationToken::new();
        let registry = build(&runtime, &cancel);
        let task = registry.spawn_event_loop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runtime.event_subscriptions(), 1);

        // A container that appears while the stream is broken is picked up
        // by the refresh after resubscribing.
        runtime.fail_events("connection reset");
        tokio::time::sleep(Duration::from_millis(10)).await;
        runtime.add_container("testnet_webui_1", LifecycleState::Running, &[]);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runtime.event_subscriptions(), 1);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(runtime.event_subscriptions(), 2);

        let webui = registry.get_service("webui").unwrap();
        assert!(webui.container().snapshot().is_some());

        cancel.cancel();
        task.await.unwrap();
    }
}
