//! Backend mode resolution through a peer's configuration.

use crate::service::descriptor::Mode;

/// Classify a peer's configured endpoint.
///
/// Our own hostname means the backend runs natively; an entry of the light
/// allow-list means light mode; anything else is an external node.
pub fn classify_mode(value: &str, native_host: &str, light_endpoints: &[String]) -> Mode {
    let value = value.trim();
    if value == native_host {
        Mode::Native
    } else if light_endpoints.iter().any(|e| e == value) {
        Mode::Light
    } else {
        Mode::External
    }
}

/// Public geth providers treated as light mode, per network.
pub fn default_light_endpoints(network: &str) -> Vec<String> {
    let endpoints: &[&str] = match network {
        "testnet" => &[
            "http://eth.kilrau.com:52041",
            "http://michael1011.at:8546",
            "http://gethxudxv2k4pv5t5a5lswq2hcv3icmj3uwg7m2n2vuykiyv77legiad.onion:8546",
        ],
        "mainnet" => &[
            "http://eth.kilrau.com:41007",
            "http://michael1011.at:8545",
            "http://gethxudxv2k4pv5t5a5lswq2hcv3icmj3uwg7m2n2vuykiyv77legiad.onion:8545",
        ],
        _ => &[],
    };
    endpoints.iter().map(|e| e.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_mode() {
        let light = vec!["neutrino".to_string()];
        assert_eq!(classify_mode("bitcoind", "bitcoind", &light), Mode::Native);
        assert_eq!(classify_mode("neutrino", "bitcoind", &light), Mode::Light);
        assert_eq!(classify_mode("10.0.0.5", "bitcoind", &light), Mode::External);
        assert_eq!(classify_mode(" bitcoind\n", "bitcoind", &[]), Mode::Native);
    }

    #[test]
    fn test_geth_light_providers() {
        let testnet = default_light_endpoints("testnet");
        assert_eq!(testnet.len(), 3);
        assert_eq!(
            classify_mode("http://eth.kilrau.com:52041", "http://geth:8545", &testnet),
            Mode::Light
        );
        assert!(default_light_endpoints("simnet").is_empty());
    }
}
