use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod dispatch;
mod error;
mod net;
mod ota;
mod protocol;
mod receiver;
mod scheduler;
mod simulate;
mod tracker;
mod types;
mod variant;

use config::{Cli, ConfigSource, DeviceConfig};
use dispatch::CommandDispatcher;
use net::Sender;
use ota::UpdateSimulator;
use receiver::Receiver;
use scheduler::Scheduler;
use simulate::SensorSimulator;
use tracker::TransactionTracker;
use types::SharedSession;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let source = ConfigSource::load(&cli).context("Failed to load configuration")?;
    init_tracing(source.log_json());

    let config = DeviceConfig::resolve(&source).context("Invalid configuration")?;
    info!(
        imei = %config.identity.imei,
        server = %config.session.server_address,
        interval = config.session.reporting_interval_secs,
        readings = config.session.reading_interval_secs,
        protocol = config.protocol.name(),
        "Device starting"
    );
    if let Some(iccid) = &config.identity.iccid {
        info!(iccid = %iccid, "SIM");
    }
    if config.motion.enabled() {
        info!(
            duration_secs = config.motion.duration_secs,
            interval_secs = config.motion.interval_secs,
            "Motion simulation enabled"
        );
    }

    let socket = Arc::new(
        UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind UDP socket")?,
    );
    info!(local = %socket.local_addr()?, "UDP socket ready");

    let session = SharedSession::new(config.session.clone());
    let tracker = Arc::new(TransactionTracker::new());
    let sender = Sender::new(
        Arc::clone(&socket),
        session.clone(),
        Arc::clone(&tracker),
        config.ack_timeout,
    );
    let protocol = config.protocol.build();
    let updates = Arc::new(UpdateSimulator::new(sender.clone(), config.update));
    let dispatcher = Arc::new(CommandDispatcher::new(
        Arc::clone(&protocol),
        session.clone(),
        sender.clone(),
        Arc::clone(&updates),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut receiver = tokio::spawn(
        Receiver::new(Arc::clone(&socket), dispatcher, shutdown_rx.clone()).run(),
    );

    let mut sensors = SensorSimulator::new(config.location.mode.clone());
    if let Some((lat, lon)) = config.location.start {
        sensors.set_start(lat, lon);
    }
    let scheduler = tokio::spawn(
        Scheduler::new(
            config.identity.clone(),
            protocol,
            session,
            sender,
            sensors,
            config.motion,
            shutdown_rx,
        )
        .run(),
    );

    // The session ends on Ctrl-C or as soon as the receiver stops.
    let receiver_done = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutdown requested");
            false
        }
        joined = &mut receiver => {
            match joined {
                Ok(Ok(())) => info!("Receiver finished"),
                Ok(Err(e)) => error!(error = %e, "Receiver failed, ending session"),
                Err(e) => error!(error = %e, "Receiver task panicked, ending session"),
            }
            true
        }
    };

    let _ = shutdown_tx.send(true);
    if !receiver_done {
        if let Ok(Err(e)) = receiver.await {
            error!(error = %e, "Receiver failed during shutdown");
        }
    }
    scheduler.await.context("Scheduler task failed")?;

    let jobs = updates.take_handles();
    let running_updates = jobs.iter().filter(|job| !job.is_finished()).count();
    info!(
        unacked = tracker.pending(),
        update_jobs = jobs.len(),
        running_updates,
        "Device stopped"
    );
    Ok(())
}
