mod capture;
mod cli;
mod config;
mod device;
mod engine;
mod events;
mod negotiation;
mod orchestrator;
mod peer;
mod pipeline;
mod presence;
mod session;
mod signaling;
mod teardown;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::device::DeviceIdentity;
use crate::engine::{Collaborators, PermissionGrant};
use crate::orchestrator::{SessionManager, SessionReport, SessionSettings};
use crate::peer::WebRtcPeerFactory;
use crate::pipeline::{CaptureSettings, GstCaptureEngine};
use crate::presence::ProcessPresence;
use crate::signaling::WsConnector;

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn log_report(report: &SessionReport) {
    let reason = report
        .snapshot
        .stop_reason
        .map(|r| r.to_string())
        .unwrap_or_else(|| "none".to_string());
    let failures = report.teardown.failures();
    if failures > 0 {
        warn!(
            device_id = %report.device_id,
            reason = %reason,
            failures,
            "Session finished with teardown failures"
        );
    } else {
        info!(device_id = %report.device_id, reason = %reason, "Session finished");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider (needed for wss:// signaling)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = cli::parse_args()?;
    init_tracing(args.log_json);

    gstreamer::init().context("Failed to initialize GStreamer")?;

    let mut config = config::load_config(&args.config_path)?;
    args.apply(&mut config);
    if !config::report_issues(&config) {
        std::process::exit(1);
    }

    info!(
        display = %args.display,
        server_url = %config.signaling.url,
        "Starting sharecast-agent"
    );

    let collaborators = Collaborators {
        capture: Arc::new(GstCaptureEngine::new(CaptureSettings::from(&config.capture))),
        peers: Arc::new(WebRtcPeerFactory),
        signaling: Arc::new(WsConnector::new(&config.signaling)),
        presence: Arc::new(ProcessPresence::new(
            config.presence.status_file.as_ref().map(PathBuf::from),
        )),
    };
    let settings = SessionSettings {
        ice_servers: config.ice.servers(),
        identity: DeviceIdentity::detect(&config.device),
    };
    let manager = SessionManager::new(collaborators, settings);

    let handle = manager
        .start(PermissionGrant::new(args.display.clone()))
        .context("Failed to start share session")?;
    info!(device_id = %handle.device_id(), "Share session started");

    let mut states = handle.subscribe();
    tokio::spawn(async move {
        let mut last = states.borrow_and_update().state;
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().state;
            if state != last {
                info!(?state, "Session state changed");
                last = state;
            }
        }
    });

    let stop = handle.stop_handle();
    let finished = handle.wait();
    tokio::pin!(finished);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let report = tokio::select! {
        report = &mut finished => report,
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, stopping share");
            stop.stop();
            finished.await
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, stopping share");
            stop.stop();
            finished.await
        }
    };

    match report {
        Ok(report) => log_report(&report),
        Err(e) => error!("Session ended abnormally: {e:#}"),
    }

    info!("Agent shutdown complete");
    Ok(())
}
