use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use ride_tracker::api::{HttpTrackingSource, TrackingSource};
use ride_tracker::config::AppConfig;
use ride_tracker::transport::ws::WsConnector;
use ride_tracker::{LiveRideChannel, RideId, SessionContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = AppConfig::load()?;

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting ride tracker...");

    let ride_id = std::env::args()
        .nth(1)
        .map(RideId::from)
        .or_else(|| config.ride_id())
        .context("no ride to observe: pass a ride id or set RIDE_ID")?;

    let credentials = config.credentials();
    if credentials.is_none() {
        warn!("USER_ID or AUTH_TOKEN missing, live tracking will not connect");
    }

    let connector = WsConnector::new(&config.api_base_url)?;
    let source = HttpTrackingSource::new(&config.api_base_url, config.request_timeout())?;
    let source: Arc<dyn TrackingSource> = Arc::new(source);

    let channel = LiveRideChannel::new(
        Arc::new(connector),
        Some(source),
        SessionContext::new(credentials),
        config.channel_settings(),
    );

    let mut observation = channel.observe(&ride_id);
    info!("Observing ride {}", ride_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            changed = observation.state.changed() => {
                if changed.is_err() {
                    break;
                }
                let ride = observation.state.borrow_and_update().clone();
                match ride {
                    Some(ride) => info!(
                        "Ride {}: status={} location={:?} driver={:?}",
                        ride.ride_id,
                        ride.ride_status,
                        ride.last_known_location.map(|l| (l.latitude, l.longitude)),
                        ride.driver_info.map(|d| d.name)
                    ),
                    None => {
                        info!("Ride {} released", ride_id);
                        break;
                    }
                }
            }
            changed = observation.connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let session = observation.connection.borrow_and_update().clone();
                info!("Connection {} (attempt {})", session.state, session.attempt);
            }
            changed = observation.notifications.changed() => {
                if changed.is_err() {
                    break;
                }
                let notes = observation.notifications.borrow_and_update().clone();
                for note in notes {
                    info!("[{:?}] {}: {}", note.category, note.title, note.message);
                }
            }
        }
    }

    channel.stop_observing(&ride_id);
    Ok(())
}
