//! Health probes per backend kind.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use serde_json::json;

use crate::container::{ContainerHandle, LogSince, LogTail};
use crate::error::RpcError;
use crate::rpc::{
    HttpHealthDialer, JsonRpcDialer, LndDialer, LndInfo, RpcClient, TcpProbeDialer, XudDialer,
};
use crate::service::RpcHealthProbe;
use crate::service::status::{READY, STARTING, StatusReport, composite_status};
use crate::service::ProbeContext;
use crate::watcher::{PatternSet, SyncProgress, syncing_text};

/// How far back lnd's logs are searched for the newest block notification.
const NEW_BLOCK_WINDOW_MINUTES: i64 = 10;

/// `getblockchaininfo` for bitcoind and litecoind.
pub struct ChainDaemonProbe {
    rpc: RpcClient<JsonRpcDialer>,
}

impl ChainDaemonProbe {
    pub fn new(rpc: RpcClient<JsonRpcDialer>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl RpcHealthProbe for ChainDaemonProbe {
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError> {
        let result = self
            .rpc
            .call(ctx.call_timeout, |c| async move { c.get_blockchain_info().await })
            .await;

        match result {
            Ok(info) => {
                let detail = json!({ "blocks": info.blocks, "headers": info.headers, "chain": info.chain });
                let text = if info.blocks > 0 && info.blocks == info.headers {
                    READY.to_string()
                } else {
                    syncing_text(info.blocks, info.headers)
                };
                Ok(StatusReport::new(text).with_detail(detail))
            }
            // Warm-up messages ("Loading block index...") are shown as is.
            Err(RpcError::Backend { message, .. }) => Ok(StatusReport::new(message)),
            Err(e) => Err(e),
        }
    }

    async fn on_container_stopped(&self) {
        self.rpc.invalidate().await;
    }

    async fn close(&self) {
        self.rpc.close().await;
    }
}

/// `eth_syncing` for geth.
pub struct GethProbe {
    rpc: RpcClient<JsonRpcDialer>,
}

impl GethProbe {
    pub fn new(rpc: RpcClient<JsonRpcDialer>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl RpcHealthProbe for GethProbe {
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError> {
        let syncing = self
            .rpc
            .call(ctx.call_timeout, |c| async move { c.eth_syncing().await })
            .await?;
        Ok(match syncing {
            None => StatusReport::ready(),
            Some(s) => StatusReport::new(syncing_text(s.current_block, s.highest_block)).with_detail(
                json!({ "current_block": s.current_block, "highest_block": s.highest_block }),
            ),
        })
    }

    async fn on_container_stopped(&self) {
        self.rpc.invalidate().await;
    }

    async fn close(&self) {
        self.rpc.close().await;
    }
}

/// lnd `getinfo`, compared against the newest block lnd logged, with
/// neutrino progress while the chain syncs.
pub struct LndProbe {
    rpc: RpcClient<LndDialer>,
    container: ContainerHandle,
    new_block: PatternSet,
}

impl LndProbe {
    pub fn new(rpc: RpcClient<LndDialer>, container: ContainerHandle) -> Self {
        Self {
            rpc,
            container,
            new_block: PatternSet::lnd_new_block(),
        }
    }
}

/// Height of the newest `NTFN: New block` line logged in the last
/// [`NEW_BLOCK_WINDOW_MINUTES`]. Log read failures count as no height.
async fn newest_block_height(container: &ContainerHandle, patterns: &PatternSet) -> Option<u64> {
    let since = LogSince::At(Utc::now() - TimeDelta::minutes(NEW_BLOCK_WINDOW_MINUTES));
    let lines = match container.logs(since, LogTail::All).await {
        Ok(lines) => lines,
        Err(e) => {
            tracing::debug!(container = %container.name(), "Failed to read lnd logs: {}", e);
            return None;
        }
    };
    lines
        .iter()
        .rev()
        .find_map(|line| patterns.match_line(line.trim()))
        .map(|(_, height)| height)
        .filter(|height| *height > 0)
}

fn lnd_sync_text(info: &LndInfo, log_height: Option<u64>, progress: Option<SyncProgress>) -> String {
    match (log_height, progress) {
        (Some(current), _) if info.block_height <= current => READY.to_string(),
        (Some(current), _) => syncing_text(current, info.block_height),
        _ if info.synced_to_chain => READY.to_string(),
        (None, Some(p)) if p.caught_up => READY.to_string(),
        (None, Some(p)) if p.has_progress() => p.syncing_text(),
        _ => "Syncing".to_string(),
    }
}

#[async_trait]
impl RpcHealthProbe for LndProbe {
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError> {
        let info = self
            .rpc
            .call(ctx.call_timeout, |c| async move { c.get_info().await })
            .await?;
        let log_height = newest_block_height(&self.container, &self.new_block).await;
        tracing::debug!(service = %ctx.service, block_height = info.block_height, ?log_height, "lnd heights");

        let detail = json!({
            "block_height": info.block_height,
            "log_height": log_height,
            "synced_to_chain": info.synced_to_chain,
            "num_active_channels": info.num_active_channels,
        });
        let text = lnd_sync_text(&info, log_height, ctx.progress);
        Ok(StatusReport::new(text).with_detail(detail))
    }

    async fn on_container_stopped(&self) {
        self.rpc.invalidate().await;
    }

    async fn close(&self) {
        self.rpc.close().await;
    }
}

/// Components folded into xud's status, with their `getinfo` keys.
const XUD_COMPONENTS: &[(&str, XudComponent)] = &[
    ("lndbtc", XudComponent::Lnd("BTC")),
    ("lndltc", XudComponent::Lnd("LTC")),
    ("connext", XudComponent::Connext),
];

enum XudComponent {
    Lnd(&'static str),
    Connext,
}

/// xud `getinfo` folded over its lnd and connext components.
pub struct XudProbe {
    rpc: RpcClient<XudDialer>,
}

impl XudProbe {
    pub fn new(rpc: RpcClient<XudDialer>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl RpcHealthProbe for XudProbe {
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError> {
        let info = self
            .rpc
            .call(ctx.call_timeout, |c| async move { c.get_info().await })
            .await?;

        let statuses: Vec<(&str, &str)> = XUD_COMPONENTS
            .iter()
            .map(|(name, component)| {
                let status = match component {
                    XudComponent::Lnd(currency) => info.lnd_status(currency),
                    XudComponent::Connext => info.connext.as_deref(),
                };
                (*name, status.unwrap_or_default())
            })
            .collect();

        let detail = statuses
            .iter()
            .map(|(name, status)| (name.to_string(), json!(status)))
            .collect::<serde_json::Map<_, _>>();
        Ok(StatusReport::new(composite_status(&statuses)).with_detail(detail.into()))
    }

    async fn on_container_stopped(&self) {
        self.rpc.invalidate().await;
    }

    async fn close(&self) {
        self.rpc.close().await;
    }
}

/// connext `/health`.
pub struct ConnextProbe {
    rpc: RpcClient<HttpHealthDialer>,
}

impl ConnextProbe {
    pub fn new(rpc: RpcClient<HttpHealthDialer>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl RpcHealthProbe for ConnextProbe {
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError> {
        let healthy = self
            .rpc
            .call(ctx.call_timeout, |c| async move { c.is_healthy().await })
            .await?;
        Ok(StatusReport::new(if healthy { READY } else { STARTING }))
    }

    async fn on_container_stopped(&self) {
        self.rpc.invalidate().await;
    }

    async fn close(&self) {
        self.rpc.close().await;
    }
}

/// One reachability connection per sub-chain.
pub struct BoltzProbe {
    chains: Vec<(String, RpcClient<TcpProbeDialer>)>,
}

impl BoltzProbe {
    pub fn new(chains: Vec<(String, RpcClient<TcpProbeDialer>)>) -> Self {
        Self { chains }
    }
}

#[async_trait]
impl RpcHealthProbe for BoltzProbe {
    async fn probe(&self, ctx: &ProbeContext<'_>) -> Result<StatusReport, RpcError> {
        let checks = self.chains.iter().map(|(chain, rpc)| async move {
            let res = rpc
                .call(ctx.call_timeout, |c| async move { c.check().await })
                .await;
            (chain.as_str(), res)
        });
        let mut results = futures::future::join_all(checks).await;

        // Nothing reachable yet: report the service as still coming up.
        let all_unreachable = !results.is_empty()
            && results
                .iter()
                .all(|(_, r)| matches!(r, Err(e) if e.is_unreachable()));
        if all_unreachable && let (_, Err(e)) = results.swap_remove(0) {
            return Err(e);
        }

        let statuses: Vec<(&str, &str)> = results
            .iter()
            .map(|(chain, r)| (*chain, if r.is_ok() { READY } else { "unreachable" }))
            .collect();
        let detail = statuses
            .iter()
            .map(|(chain, status)| (chain.to_string(), json!(*status == READY)))
            .collect::<serde_json::Map<_, _>>();
        Ok(StatusReport::new(composite_status(&statuses)).with_detail(detail.into()))
    }

    async fn on_container_stopped(&self) {
        for (_, rpc) in &self.chains {
            rpc.invalidate().await;
        }
    }

    async fn close(&self) {
        for (_, rpc) in &self.chains {
            rpc.close().await;
        }
    }
}
