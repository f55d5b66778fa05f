use crate::{backend, config::HarnessConfig, subnode};
use anyhow::Context;
use relay_dispatcher::RelayServer;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy)]
pub struct ServeOptions {
    pub enable_pollers: bool,
    pub enable_expiry_sweep: bool,
}

pub async fn run(cfg: &HarnessConfig, opts: ServeOptions) -> anyhow::Result<()> {
    let relay_cfg = cfg.relay_config()?;

    let backends = backend::build(cfg).await?;
    subnode::declare(backends.store.as_ref(), &cfg.declare_subnodes)
        .await
        .context("declare subnodes")?;

    let bind: SocketAddr = cfg
        .relay_bind
        .parse()
        .with_context(|| format!("parse RELAY_BIND={}", cfg.relay_bind))?;

    let server = RelayServer::start(
        relay_cfg,
        backends,
        bind,
        opts.enable_pollers,
        opts.enable_expiry_sweep,
    )
    .await?;
    tracing::info!(
        event = "harness.relay.listening",
        addr = %server.addr,
        backend = ?cfg.backend,
        pollers = opts.enable_pollers,
        "relay listening"
    );

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!(event = "harness.relay.shutdown", "relay shutting down");
    server.shutdown().await?;
    Ok(())
}
