use std::net::SocketAddr;

use anyhow::Context as _;
use async_trait::async_trait;
use skybridge_task::{StopSignal, Task};
use tokio::net::TcpListener;

use crate::BridgeState;
use crate::api;

/// The HTTP listener serving the ActivityPub surface.
pub struct HttpListener {
    addr: SocketAddr,
    listener: TcpListener,
    state: BridgeState,
}

impl HttpListener {
    pub async fn init_and_bind(addr: SocketAddr, state: BridgeState) -> anyhow::Result<Self> {
        info!(%addr, "Initiating listener…");

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        let addr = listener.local_addr().context("failed to read bound address")?;

        info!(%addr, "Listener started successfully");

        Ok(Self { addr, listener, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl Task for HttpListener {
    type Output = anyhow::Result<()>;

    fn name(&self) -> &'static str {
        "http listener"
    }

    async fn run(self, mut stop: StopSignal) -> Self::Output {
        let router: axum::Router = api::make_router(self.state);

        axum::serve(self.listener, router)
            .with_graceful_shutdown(async move { stop.requested().await })
            .await
            .context("HTTP server failure")
    }
}
