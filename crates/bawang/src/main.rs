//! The bawang relay binary.
//!
//! Wires the onion-routing core to the real world: a TLS listener for
//! peers, a TCP listener for the local client API, the RPS service as
//! the peer sampler, and signal-driven shutdown.

#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![deny(clippy::unwrap_used)]

mod api;
mod config;
mod rps;
mod tls;

use anyhow::Context;
use bawang_api::RpsClient;
use bawang_crypto::IdentityKeypair;
use bawang_proto::Router;
use clap::Parser;
use config::Config;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt};

/// A peer-to-peer onion-routing relay.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;
    runtime.block_on(run(config))
}

/// Bring the node up and keep it up until a termination signal.
async fn run(config: Config) -> anyhow::Result<()> {
    let hostkey_pem = std::fs::read_to_string(&config.hostkey)
        .with_context(|| format!("reading hostkey {}", config.hostkey.display()))?;
    let identity = IdentityKeypair::from_pem(&hostkey_pem).context("parsing hostkey")?;

    let tls = tls::TlsContext::new(&config.p2p_hostname)?;
    let sampler = rps::RpsSampler::new(RpsClient::new(
        config.rps_api_address,
        config.api_timeout(),
    ));
    let router = Router::new(
        config.router_config(),
        identity,
        Box::new(tls.link_connector()),
        Box::new(sampler),
    )
    .context("constructing router")?;

    let p2p_listener = TcpListener::bind((config.p2p_hostname.as_str(), config.p2p_port))
        .await
        .with_context(|| {
            format!(
                "binding p2p listener on {}:{}",
                config.p2p_hostname, config.p2p_port
            )
        })?;
    info!("p2p listener on {}", p2p_listener.local_addr()?);

    let api_listener = TcpListener::bind(config.api_address)
        .await
        .with_context(|| format!("binding api listener on {}", config.api_address))?;
    info!("api listener on {}", api_listener.local_addr()?);

    let quit = CancellationToken::new();

    let scheduler = {
        let router = router.clone();
        tokio::spawn(async move { router.run().await })
    };
    let p2p = {
        let router = router.clone();
        let acceptor = tls.acceptor();
        let quit = quit.clone();
        tokio::spawn(async move { accept_peers(p2p_listener, acceptor, router, quit).await })
    };
    let api = {
        let router = router.clone();
        let quit = quit.clone();
        tokio::spawn(async move { api::serve(api_listener, router, quit).await })
    };

    wait_for_shutdown().await;
    info!("shutting down");
    quit.cancel();
    router.shutdown();
    let _ = tokio::join!(scheduler, p2p, api);
    Ok(())
}

/// Accept peer connections and hand them to the router as links.
async fn accept_peers(
    listener: TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
    router: Router,
    quit: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = quit.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (tcp, addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("p2p accept failed: {}", e);
                continue;
            }
        };
        let _ = tcp.set_nodelay(true);
        let acceptor = acceptor.clone();
        let router = router.clone();
        tokio::spawn(async move {
            match acceptor.accept(tcp).await {
                Ok(stream) => router.handle_incoming(Box::new(stream), addr),
                Err(e) => warn!("tls accept from {} failed: {}", addr, e),
            }
        });
    }
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sig) => sig,
            Err(e) => {
                warn!("cannot listen for SIGTERM: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
