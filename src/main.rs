//! camloop demo: stream frames from a camera and print delivery statistics

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camloop::capture::{self, Frame, FrameDescriptor, StatsSnapshot};
use camloop::{utils, CaptureError, Config};
use color_eyre::{eyre::eyre, Result};
use flume::bounded;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::uptime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camloop=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_timer(uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing()?;

    info!("camloop launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;

    match utils::list_devices(config.capture.backend) {
        Ok(devices) => info!("Available devices: {:?}", devices),
        Err(e) => warn!("Device listing failed: {}", e),
    }

    // Auto-detect capture device if needed
    if config.capture.device.is_empty() && config.capture.backend == capture::Backend::V4l2 {
        let found = tokio::task::spawn_blocking(utils::auto_detect_device).await??;
        config.capture.device = found.path;
        config.capture.format = found.format;
    }
    camloop::CONFIG.store(Arc::new(config.clone()));
    info!("Using capture device: {:?}", config.capture.device);

    let stop = Arc::new(AtomicBool::new(false));
    let (tx, rx) = bounded::<Frame>(config.pipeline.frame_queue);
    let (stats_tx, stats_rx) = flume::bounded(1);

    // Capture runs on a blocking thread: the session is driven synchronously
    let capture_stop = stop.clone();
    let capture_config = config.capture.clone();
    let capture_handle = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut session = capture::open_session(&capture_config)?;
        let pixel_format = session
            .format()
            .and_then(|f| f.pixel_format())
            .unwrap_or(capture_config.format);
        let _ = stats_tx.send(session.stats());

        session.on_frame(Box::new(move |frame: &FrameDescriptor<'_>| {
            // Consumer lagging: drop rather than stall the driver
            let _ = tx.try_send(frame.to_frame(pixel_format));
        }));
        session.start_streaming(capture_config.fps)?;

        while !capture_stop.load(Ordering::Relaxed) {
            match session.dispatch() {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!("Capture error: {}", e);
                    return Err(e.into());
                }
                Err(e @ CaptureError::InvalidState { .. }) => return Err(e.into()),
                Err(e) => warn!("Dispatch failed: {}", e),
            }
        }

        session.stop_streaming()?;
        session.close();
        Ok(())
    });

    let stats = match stats_rx.recv_async().await {
        Ok(stats) => stats,
        Err(_) => {
            capture_handle.await??;
            return Err(eyre!("capture thread exited before streaming"));
        }
    };

    // Consumer: account for every copied frame
    let consumer = tokio::spawn(async move {
        let mut frames = 0u64;
        let mut bytes = 0usize;
        let mut skipped = 0u64;
        let mut last_sequence = None;
        while let Ok(frame) = rx.recv_async().await {
            frames += 1;
            bytes += frame.data.len();
            if let Some(prev) = last_sequence {
                skipped += frame.meta.sequence.saturating_sub(prev + 1);
            }
            last_sequence = Some(frame.meta.sequence);
        }
        (frames, bytes, skipped)
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(config.pipeline.stats_interval_ms));
    let mut last = StatsSnapshot::default();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                break;
            }
            _ = ticker.tick() => {
                let now = stats.snapshot();
                info!(
                    delivered = now.delivered - last.delivered,
                    dropped = now.dropped - last.dropped,
                    cancelled = now.cancelled - last.cancelled,
                    "frames this interval"
                );
                last = now;
            }
        }
        if capture_handle.is_finished() {
            break;
        }
    }

    stop.store(true, Ordering::Relaxed);
    capture_handle.await??;
    let (frames, bytes, skipped) = consumer.await?;

    info!(
        "camloop shutting down: {} frames, {} bytes consumed, {} sequence gaps",
        frames, bytes, skipped
    );
    Ok(())
}
