mod channel;
mod config;
mod handlers;
mod ledger;
mod price_feed;
mod registry;
mod runner;
mod scheduler;
mod state;
mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::PriceProcess;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::channel::BidderHub;
use crate::config::ProviderConfig;
use crate::ledger::{HttpLedger, Ledger, OpenLedger};
use crate::price_feed::{run_price_ticker, PriceFeed};
use crate::registry::run_registry_loop;
use crate::runner::ProcessRunner;
use crate::scheduler::{pump_runner_events, Scheduler};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("provider=debug,tower_http=info,axum=info")),
        )
        .init();

    let cfg = ProviderConfig::parse();
    cfg.validate()?;

    // precio de reserva
    let seed = cfg.price_seed.unwrap_or_else(rand::random);
    let process = PriceProcess::new(cfg.price_floor, cfg.price_ceil, seed)
        .context("no se pudo crear el proceso de precio")?;
    let price = Arc::new(PriceFeed::new(process, cfg.price_history));

    // runner + scheduler
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let runner = Arc::new(ProcessRunner::new(
        cfg.launcher.clone(),
        cfg.launcher_args.clone(),
        cfg.terminate_grace(),
        events_tx,
    ));
    let hub = Arc::new(BidderHub::new());
    let scheduler = Arc::new(
        Scheduler::new(cfg.capacity, runner, hub.clone()).with_retention(cfg.terminal_retention),
    );

    let ledger: Arc<dyn Ledger> = match &cfg.ledger_url {
        Some(url) => {
            info!("reteniendo ofertas en {} (escrow={})", url, cfg.escrow_account);
            Arc::new(HttpLedger::new(url, cfg.escrow_account))
        }
        None => {
            warn!("sin LEDGER_URL: las ofertas no se retienen");
            Arc::new(OpenLedger)
        }
    };

    let state = AppState {
        scheduler: scheduler.clone(),
        price: price.clone(),
        hub,
        ledger,
    };

    // tareas en segundo plano
    tokio::spawn(pump_runner_events(scheduler, events_rx));
    tokio::spawn(run_price_ticker(price, cfg.price_tick()));
    if let Some(url) = cfg.registry_url.clone() {
        let address = cfg.public_address();
        info!("anunciando {} en {}", address, url);
        tokio::spawn(run_registry_loop(
            state.clone(),
            url,
            address,
            cfg.registry_interval(),
        ));
    }

    let app = handlers::build_router(state);

    let listener = TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", cfg.listen))?;
    info!(
        "provider escuchando en {} (capacidad={}, banda=[{}, {}], seed={}, launcher={} {:?})",
        listener.local_addr()?,
        cfg.capacity,
        cfg.price_floor,
        cfg.price_ceil,
        seed,
        cfg.launcher,
        cfg.launcher_args
    );

    axum::serve(listener, app).await?;
    Ok(())
}
