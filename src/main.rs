//! Fast Pair Audit - Main Entry Point

use std::sync::Arc;

use clap::Parser;
use fastpair_audit::{
    FastPairAuditor,
    backend::BluerBackend,
    config::{CliArgs, Settings},
    store::JsonPairingStore,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fastpair_audit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = CliArgs::parse();
    info!(?args, "Starting Fast Pair audit");
    let settings = Settings::from(args);

    let backend = Arc::new(BluerBackend::new(settings.adapter.as_deref()).await?);
    let store = JsonPairingStore::open(&settings.store_path)?;
    let auditor = FastPairAuditor::new(
        backend,
        Box::new(store),
        settings.model_id_format,
        settings.timings,
    );

    if settings.clear_paired {
        auditor.clear_paired().await?;
    }

    tokio::select! {
        result = run(&auditor, &settings) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT (Ctrl+C), shutting down");
        }
        _ = shutdown_signal() => {
            info!("Received SIGTERM, shutting down");
        }
    }

    if let Err(e) = auditor.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
    info!("Shutting down...");
    Ok(())
}

async fn run(
    auditor: &FastPairAuditor<BluerBackend>,
    settings: &Settings,
) -> Result<(), Box<dyn std::error::Error>> {
    auditor.start_scan().await?;
    info!("Scanning for {:?}", settings.scan_duration);
    tokio::time::sleep(settings.scan_duration).await;
    auditor.stop_scan().await?;

    auditor.mark_known_pairings().await;
    let devices = auditor.devices().await;
    println!("{} device(s) found", devices.len());
    for (index, device) in devices.iter().enumerate() {
        println!(
            "[{:2}] {} {:<24} rssi {:4} model {:<6} {}{}{}",
            index,
            device.address,
            device.name,
            device.rssi,
            device.model_id,
            if device.is_fast_pair { "FP " } else { "" },
            if device.is_nearby { "NB " } else { "" },
            if device.is_paired { "PAIRED" } else { "" },
        );
    }

    let Some(index) = settings.test_index else {
        return Ok(());
    };
    let expected = devices.get(index).map(|d| d.name.as_str());
    let mut target = auditor.find_target(index, expected).await?;

    match auditor.pair_target(&mut target).await {
        Ok(report) => {
            for strategy in &report.strategies {
                println!(
                    "{:<6} {} key readable: {} key in ads: {} -> {:?}",
                    strategy.strategy,
                    strategy.address,
                    strategy.key_readable,
                    strategy.key_in_ads,
                    strategy.outcome
                );
            }
            println!("{} ({}): {}", target.name, target.address_text, report.verdict);
            println!("Vulnerable devices this session: {}", auditor.vulnerable_count());
        }
        Err(e) => {
            error!("Test of {} failed: {}", target.address_text, e);
            return Err(e.into());
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    std::future::pending::<()>().await
}
