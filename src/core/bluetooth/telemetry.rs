//! GPS telemetry watcher
//! Forwards position fixes to the cart while connected.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::link_config::TelemetryConfig;
use crate::core::bluetooth::commands::CommandChannel;
use crate::core::bluetooth::notifier::Notifier;
use crate::core::bluetooth::types::{GpsSample, LinkEvent};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in metres
pub fn haversine_m(a: GpsSample, b: GpsSample) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Decides which samples are worth a write
pub struct TelemetryFilter {
    min_interval: Duration,
    min_distance_m: f64,
    last_sent: Option<(GpsSample, Instant)>,
}

impl TelemetryFilter {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            min_distance_m: config.min_distance_m,
            last_sent: None,
        }
    }

    /// Returns true and records the sample if it should be sent
    pub fn accept(&mut self, sample: GpsSample, now: Instant) -> bool {
        let accepted = match self.last_sent {
            None => true,
            Some((last, at)) => {
                now.saturating_duration_since(at) >= self.min_interval
                    && haversine_m(last, sample) >= self.min_distance_m
            }
        };
        if accepted {
            self.last_sent = Some((sample, now));
        }
        accepted
    }
}

/// Background task forwarding filtered position fixes to the cart
pub struct TelemetryWatcher {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TelemetryWatcher {
    pub fn spawn(
        samples: BoxStream<'static, GpsSample>,
        channel: CommandChannel,
        config: &TelemetryConfig,
        notifier: Notifier,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let filter = TelemetryFilter::new(config);
        let handle = tokio::spawn(Self::watch(
            samples,
            channel,
            filter,
            notifier,
            cancel_token.clone(),
        ));
        info!("Telemetry watcher started");
        Self {
            cancel_token,
            handle,
        }
    }

    async fn watch(
        mut samples: BoxStream<'static, GpsSample>,
        channel: CommandChannel,
        mut filter: TelemetryFilter,
        notifier: Notifier,
        cancel_token: CancellationToken,
    ) {
        loop {
            let sample = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                sample = samples.next() => match sample {
                    Some(sample) => sample,
                    None => {
                        info!("Location stream has ended.");
                        break;
                    }
                },
            };

            if !filter.accept(sample, Instant::now()) {
                debug!("Skipping telemetry sample {:?}", sample);
                continue;
            }
            if let Err(e) = channel.send_telemetry(sample).await {
                warn!("Telemetry write failed: {}", e);
                notifier.emit(LinkEvent::WriteFailed {
                    reason: e.to_string(),
                });
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        self.cancel_token.cancel();
        info!("Telemetry watcher stopped");
    }
}
