use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use veilgate_core::auth::{CredentialStore, SqlStore, StaticStore};
use veilgate_core::client::{ClientContext, ClientRuntime};
use veilgate_core::config::{Config, RunType};
use veilgate_core::meter::{NullMeter, SqlMeter, TrafficMeter};
use veilgate_core::router::Router;
use veilgate_core::server::Server;

/// A TLS tunnel that looks like an ordinary HTTPS server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: String,

    /// Validate the configuration and exit
    #[arg(long)]
    test_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config).context("failed to load configuration")?;
    if args.test_config {
        println!("configuration ok");
        return Ok(());
    }
    veilgate_core::logging::init_logging(config.log_level);

    let config = Arc::new(config);
    let router = Arc::new(Router::from_config(&config.router).context("failed to build router")?);
    let cancel = CancellationToken::new();

    let result = match config.run_type {
        RunType::Server => run_server(config, router, cancel.clone()).await,
        RunType::Client => {
            let store = StaticStore::new(&config.passwords);
            let ctx = ClientContext::new(Arc::clone(&config), router, &store, &cancel)?;
            let runtime = ClientRuntime::new(ctx, cancel.clone());
            race_with_signals(runtime.run(), &cancel).await
        }
        RunType::Forward => {
            let store = StaticStore::new(&config.passwords);
            let ctx = ClientContext::new(Arc::clone(&config), router, &store, &cancel)?;
            race_with_signals(veilgate_core::forward::run(ctx, cancel.clone()), &cancel).await
        }
        RunType::Nat => {
            #[cfg(target_os = "linux")]
            {
                let store = StaticStore::new(&config.passwords);
                let ctx = ClientContext::new(Arc::clone(&config), router, &store, &cancel)?;
                race_with_signals(veilgate_core::tproxy::run(ctx, cancel.clone()), &cancel).await
            }
            #[cfg(not(target_os = "linux"))]
            {
                anyhow::bail!("nat mode requires linux transparent-proxy support");
            }
        }
    };
    cancel.cancel();
    result.map_err(Into::into)
}

async fn run_server(
    config: Arc<Config>,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> veilgate_core::Result<()> {
    let (store, meter, sql_meter): (
        Arc<dyn CredentialStore>,
        Arc<dyn TrafficMeter>,
        Option<Arc<SqlMeter>>,
    ) = if config.mysql.enabled {
        let store = SqlStore::connect(&config.mysql, &config.passwords, cancel.child_token()).await?;
        let meter = SqlMeter::start(store.pool().clone(), cancel.child_token());
        (store, Arc::clone(&meter) as Arc<dyn TrafficMeter>, Some(meter))
    } else {
        (Arc::new(StaticStore::new(&config.passwords)), Arc::new(NullMeter), None)
    };

    let server = Server::new(config, store, meter, router, cancel.clone())?;
    let result = race_with_signals(server.run(), &cancel).await;

    // drain pending counters before the process exits
    if let Some(meter) = sql_meter {
        if let Err(e) = meter.flush_now().await {
            tracing::warn!(error = %e, "final traffic flush failed");
        }
    }
    result
}

/// Runs the given runtime until it finishes or a shutdown signal arrives.
async fn race_with_signals<F>(
    runtime: F,
    cancel: &CancellationToken,
) -> veilgate_core::Result<()>
where
    F: std::future::Future<Output = veilgate_core::Result<()>>,
{
    tokio::select! {
        r = runtime => r,
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            cancel.cancel();
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
