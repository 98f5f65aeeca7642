//! Registry behavior against an in-memory container runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use dockwatch::ServiceRegistry;
use dockwatch::config::Config;
use dockwatch::container::{EventKind, LifecycleState, LogSince, LogTail};
use dockwatch::error::ConfigError;
use dockwatch::testing::FakeRuntime;

fn no_env(_: &str) -> Result<Option<String>, ConfigError> {
    Ok(None)
}

fn sample() -> Config {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("dockwatch.example.toml");
    let text = std::fs::read_to_string(&path).unwrap();
    Config::parse(&text, &path, &no_env).unwrap()
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn status_rows_follow_containers_and_modes() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_container("testnet_lndbtc_1", LifecycleState::Running, &["BITCOIND_HOST=neutrino"]);
    runtime.add_container("testnet_lndltc_1", LifecycleState::Running, &["LITECOIND_HOST=10.0.0.5"]);
    runtime.add_container("testnet_webui_1", LifecycleState::Running, &[]);
    runtime.add_container("testnet_xud_1", LifecycleState::Exited, &[]);

    let config = sample();
    let registry = ServiceRegistry::from_config(&config, runtime.clone(), CancellationToken::new()).unwrap();
    assert_eq!(registry.len(), 11);

    let statuses = registry.get_status().await;
    let row = |name: &str| {
        statuses
            .iter()
            .find(|s| s.service == name)
            .map(|s| s.status.clone())
            .unwrap()
    };

    assert_eq!(statuses.len(), 11);
    assert_eq!(statuses[0].service, "lndbtc");
    assert_eq!(row("bitcoind"), "Ready (light mode)");
    assert_eq!(row("litecoind"), "Ready (connected to external)");
    assert_eq!(row("xud"), "Container exited");
    assert_eq!(row("arby"), "Disabled");
    assert_eq!(row("webui"), "Ready");
    assert_eq!(row("proxy"), "Container missing");
    // connext has no container, so geth cannot read its provider setting.
    assert!(row("geth").starts_with("Error: "), "{}", row("geth"));

    registry.close().await;
}

#[tokio::test]
async fn event_loop_tracks_container_lifecycle() {
    let runtime = Arc::new(FakeRuntime::new());
    let config = sample();
    let registry = Arc::new(
        ServiceRegistry::from_config(&config, runtime.clone(), CancellationToken::new()).unwrap(),
    );
    let events = registry.spawn_event_loop();
    wait_for(|| runtime.event_subscriptions() == 1).await;

    let proxy = registry.get_service("proxy").unwrap();
    assert!(proxy.container().snapshot().is_none());

    runtime.add_container("testnet_proxy_1", LifecycleState::Running, &[]);
    runtime.emit("testnet_proxy_1", EventKind::Start);
    wait_for(|| proxy.container().snapshot().is_some()).await;
    assert_eq!(registry.status_of("proxy").await.unwrap().text, "Ready");

    runtime.remove_container("testnet_proxy_1");
    runtime.emit("testnet_proxy_1", EventKind::Destroy);
    wait_for(|| proxy.container().snapshot().is_none()).await;
    assert_eq!(registry.status_of("proxy").await.unwrap().text, "Container missing");

    registry.close().await;
    events.await.unwrap();
}

#[tokio::test]
async fn logs_and_exec_reach_the_container() {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_container("testnet_xud_1", LifecycleState::Running, &[]);
    runtime.push_logs("testnet_xud_1", &["xud starting", "xud ready"]);
    runtime.set_exec_response("testnet_xud_1", "{\"version\":\"1.2.4\"}\n", 0);

    let registry = ServiceRegistry::from_config(&sample(), runtime.clone(), CancellationToken::new()).unwrap();

    let lines = registry.logs("xud", LogSince::Beginning, LogTail::Lines(1)).await.unwrap();
    assert_eq!(lines, vec!["xud ready".to_string()]);

    let output = registry
        .exec("xud", &["xucli".to_string(), "getinfo".to_string(), "-j".to_string()])
        .await
        .unwrap();
    assert!(output.success());
    assert!(output.output.contains("1.2.4"));

    assert!(registry.exec("nope", &["true".to_string()]).await.is_err());
    registry.close().await;
}
