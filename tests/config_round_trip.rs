//! The sample service list parses, orders and serializes as documented.

use std::path::Path;

use pretty_assertions::assert_eq;

use dockwatch::config::Config;
use dockwatch::error::ConfigError;
use dockwatch::service::{Mode, ServiceKind, ServiceSummary};

fn no_env(_: &str) -> Result<Option<String>, ConfigError> {
    Ok(None)
}

fn sample() -> Config {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("dockwatch.example.toml");
    let text = std::fs::read_to_string(&path).unwrap();
    Config::parse(&text, &path, &no_env).unwrap()
}

#[test]
fn sample_config_keeps_dependency_order() {
    let config = sample();
    let names: Vec<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "lndbtc", "lndltc", "bitcoind", "litecoind", "connext", "geth", "xud", "arby",
            "boltz", "webui", "proxy",
        ]
    );
    for (i, service) in config.services.iter().enumerate() {
        for peer in service.peers() {
            let at = names.iter().position(|n| *n == peer).unwrap();
            assert!(at < i, "{} must come after {}", service.name, peer);
        }
    }
}

#[test]
fn sample_config_fills_defaults() {
    let config = sample();
    assert_eq!(config.network, "testnet");

    let bitcoind = &config.services[2];
    assert_eq!(bitcoind.kind, ServiceKind::Bitcoind);
    assert_eq!(bitcoind.container, "testnet_bitcoind_1");
    assert_eq!(bitcoind.rpc.host, "bitcoind");
    let probe = bitcoind.mode_probe.as_ref().unwrap();
    assert_eq!(probe.peer, "lndbtc");
    assert_eq!(probe.native_host, "bitcoind");

    let geth = config.services.iter().find(|s| s.name == "geth").unwrap();
    assert_eq!(geth.mode_probe.as_ref().unwrap().light_endpoints.len(), 3);

    let boltz = config.services.iter().find(|s| s.name == "boltz").unwrap();
    assert_eq!(boltz.rpc.ports.get("btc"), Some(&9002));
    assert_eq!(boltz.rpc.ports.get("ltc"), Some(&9003));

    assert_eq!(config.settings.status_timeout.as_secs(), 10);
    assert_eq!(config.settings.setup_history, 1024);
}

#[test]
fn summaries_serialize_lowercase() {
    let config = sample();
    let arby = config.services.iter().find(|s| s.name == "arby").unwrap();
    let summary = ServiceSummary::from(arby);
    assert_eq!(summary.mode, Mode::Native);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["kind"], "arby");
    assert_eq!(json["mode"], "native");
    assert_eq!(json["disabled"], true);
    assert_eq!(json["depends_on"][0], "xud");
}

#[test]
fn env_overrides_file() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("dockwatch.example.toml");
    let text = std::fs::read_to_string(&path).unwrap();
    let env = |key: &str| -> Result<Option<String>, ConfigError> {
        Ok(match key {
            "DOCKWATCH_STATUS_TIMEOUT_SECS" => Some("2".to_string()),
            "DOCKWATCH_NETWORK" => Some("mainnet".to_string()),
            _ => None,
        })
    };
    let config = Config::parse(&text, &path, &env).unwrap();
    assert_eq!(config.settings.status_timeout.as_secs(), 2);
    assert_eq!(config.services[0].container, "mainnet_lndbtc_1");
}

#[test]
fn broken_entries_are_rejected() {
    let text = r#"
        [[services]]
        name = "lndbtc"
        kind = "lnd"
        [services.rpc]
        macaroon = "/root/.lndbtc/readonly.macaroon"
    "#;
    let err = Config::parse(text, Path::new("inline.toml"), &no_env).unwrap_err();
    assert!(err.to_string().contains("tls_cert"), "{err}");

    let text = r#"
        [[services]]
        name = "xud"
        kind = "xud"
        depends_on = ["lndbtc"]
    "#;
    let err = Config::parse(text, Path::new("inline.toml"), &no_env).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidService { .. }));
}
