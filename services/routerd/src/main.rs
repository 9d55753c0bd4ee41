// Router daemon entry point.
use anyhow::{Context, Result};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use syrinx_router::{Protocol, Router};

mod config;

use config::RouterdConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Configure logging from environment for easy local tweaking.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path =
        std::env::var("SYRINX_CONFIG").unwrap_or_else(|_| "routerd.json".to_string());
    let config = RouterdConfig::load(&config_path)?;
    tracing::info!(?config, "loaded config");

    let mut router = Router::new();
    router.set_max_connections(config.max_connections);
    router.set_do_failover(config.do_failover);
    router.set_test_conn_interval(Duration::from_secs(config.test_conn_interval));
    router.set_test_conn_timeout(Duration::from_secs(config.test_conn_timeout));
    for protocol in &config.protocols {
        router.add_protocol(
            protocol.address.clone(),
            Protocol {
                network: protocol.network.clone(),
                marshal: protocol.marshal.clone(),
                address: protocol.address.clone(),
            },
        );
    }
    if let Some(failover) = &config.failover {
        router.set_failover_protocol(Protocol {
            network: failover.network.clone(),
            marshal: failover.marshal.clone(),
            address: failover.address.clone(),
        });
    }

    router.start().await.context("start router")?;
    tracing::info!("router started");

    run_until_signalled(&mut router).await?;
    router.shutdown().await;
    tracing::info!("router stopped");
    Ok(())
}

// SIGUSR1 dumps the client table, SIGUSR2 triggers failover; interrupt
// exits.
#[cfg(unix)]
async fn run_until_signalled(router: &mut Router) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    let mut usr2 = signal(SignalKind::user_defined2()).context("install SIGUSR2 handler")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("wait for interrupt")?;
                tracing::info!("exiting on interrupt");
                return Ok(());
            }
            _ = usr1.recv() => router.log_clients().await,
            _ = usr2.recv() => router.failover().await,
        }
    }
}

#[cfg(not(unix))]
async fn run_until_signalled(_router: &mut Router) -> Result<()> {
    tokio::signal::ctrl_c().await.context("wait for interrupt")?;
    tracing::info!("exiting on interrupt");
    Ok(())
}
