//! Service core: colour-bar mode and screencast capture mode.
//!
//! Both modes stop on the shared [`Shutdown`] and report the reason they
//! stopped; the binary maps it to an exit status.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use portalcam_core::capture::pattern::color_bars;
use portalcam_core::capture::sink::{DeviceSink, OutputPixelFormat, SinkFormat, V4l2Loopback};
use portalcam_core::capture::validate::{WriteTracker, WriteVerdict};
use portalcam_core::{CaptureError, Shutdown, ShutdownReason};

use crate::config::CamConfig;

// ── CamService ───────────────────────────────────────────────────

/// The top-level portalcam service.
///
/// Owns the output device path, the configuration and the process-wide
/// shutdown handle.
pub struct CamService {
    config: CamConfig,
    device: PathBuf,
    shutdown: Shutdown,
}

impl CamService {
    pub fn new(config: CamConfig) -> Self {
        let device = PathBuf::from(&config.device.path);
        Self {
            config,
            device,
            shutdown: Shutdown::new(),
        }
    }

    /// Handle for signal handlers and other tasks.
    pub fn stop_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Ask the running mode to stop.
    pub fn stop(&self) {
        self.shutdown.request(ShutdownReason::Interrupted);
    }

    /// Whether no stop has been requested yet.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_requested()
    }

    // ── Colour-bar mode ──────────────────────────────────────────

    /// Write colour bars to the device until stopped.
    pub async fn run_pattern(&self) -> Result<ShutdownReason, CaptureError> {
        let (width, height, fps) = self.config.pattern_geometry();
        let (mut sink, output_side) = open_device(&self.device)?;
        let format = configure_pattern_format(&mut sink, output_side, width, height)?;
        let frame = color_bars(&format);
        info!(
            width,
            height,
            fps,
            format = ?format.pixel_format,
            "writing colour bars to {}",
            self.device.display()
        );

        let mut tracker = WriteTracker::new(self.config.to_pipeline_config().max_write_failures);
        let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut written: u64 = 0;

        while self.is_running() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.requested() => break,
            }
            let result = sink.write_frame(&frame);
            match &result {
                Ok(_) => written += 1,
                Err(e) => warn!("frame write failed: {e}"),
            }
            if tracker.record(&result, true) == WriteVerdict::Shutdown {
                self.shutdown.request(ShutdownReason::SinkFailed);
            }
        }

        info!(frames = written, "colour-bar mode stopped");
        Ok(self.reason())
    }

    // ── Capture mode ─────────────────────────────────────────────

    /// Negotiate a screencast session and stream it to the device.
    #[cfg(feature = "desktop")]
    pub async fn run_capture(&self) -> Result<ShutdownReason, CaptureError> {
        use portalcam_core::capture::egl::gpu_importer;
        use portalcam_core::capture::import::BufferImporter;
        use portalcam_core::capture::pipewire::run_stream;
        use portalcam_core::portal::dbus::DbusPortal;
        use portalcam_core::portal::{Negotiator, SessionLiveness, monitor_session};
        use portalcam_core::{FramePipeline, PortalError};
        use tracing::error;

        let (sink, _) = open_device(&self.device)?;

        let mut bus = DbusPortal::connect().await?;
        let mut negotiator =
            Negotiator::new(self.config.to_source_selection(), SessionLiveness::new());
        let live = match negotiator.run(&mut bus, &self.shutdown).await {
            Ok(live) => live,
            Err(PortalError::Cancelled) => return Ok(self.reason()),
            Err(e) => {
                error!("screencast handshake failed: {e}");
                return Ok(self.reason());
            }
        };
        info!(
            session = %live.session_handle,
            node_id = live.node_id,
            streams = live.streams.len(),
            "screencast started"
        );

        let monitor = {
            let session = live.session_handle.clone();
            let liveness = live.liveness.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                monitor_session(&mut bus, &session, liveness, shutdown).await;
            })
        };

        let pipeline_config = self.config.to_pipeline_config();
        let liveness = live.liveness;
        let shutdown = self.shutdown.clone();
        let (remote, node_id) = (live.remote, live.node_id);
        // The GL context is created and used on the stream thread.
        let stream = tokio::task::spawn_blocking(move || {
            let mut importer = BufferImporter::new();
            if let Some(gpu) = gpu_importer() {
                importer = importer.with_gpu(Box::new(gpu));
            }
            info!(gpu_import = importer.has_gpu(), "buffer importer ready");
            let pipeline =
                FramePipeline::new(sink, importer, &pipeline_config, liveness, shutdown.clone());
            run_stream(remote, node_id, pipeline, shutdown)
        });

        match stream.await {
            Ok(Ok(())) => debug!("stream loop returned"),
            Ok(Err(e)) => {
                error!("stream failed: {e}");
                self.shutdown.request(ShutdownReason::StreamFailed);
            }
            Err(e) => {
                error!("stream thread panicked: {e}");
                self.shutdown.request(ShutdownReason::StreamFailed);
            }
        }
        self.shutdown.request(ShutdownReason::Interrupted);
        let _ = monitor.await;
        Ok(self.reason())
    }

    /// Capture mode needs the desktop adapters.
    #[cfg(not(feature = "desktop"))]
    pub async fn run_capture(&self) -> Result<ShutdownReason, CaptureError> {
        Err(CaptureError::Stream(
            "built without the `desktop` feature; rebuild with it or use --color-bars".into(),
        ))
    }

    // ── Internal ─────────────────────────────────────────────────

    fn reason(&self) -> ShutdownReason {
        self.shutdown.reason().unwrap_or(ShutdownReason::Interrupted)
    }
}

/// Open the device and report whether it advertises the output side.
fn open_device(path: &std::path::Path) -> Result<(V4l2Loopback, bool), CaptureError> {
    let sink = V4l2Loopback::open(path)?;
    let output_side = match sink.query_capabilities() {
        Ok(caps) => {
            info!(
                driver = %caps.driver,
                card = %caps.card,
                output = caps.supports_output(),
                capture = caps.supports_capture(),
                read_write = caps.supports_read_write(),
                "output device"
            );
            if !caps.supports_output() {
                warn!(
                    "{} does not advertise video output; is it a v4l2loopback device?",
                    path.display()
                );
            }
            caps.supports_output()
        }
        Err(e) => {
            warn!("could not query device capabilities: {e}");
            true
        }
    };
    Ok((sink, output_side))
}

/// YUYV first, XRGB32 when the device refuses it. Devices without an
/// output side get the format on their capture side.
fn configure_pattern_format(
    sink: &mut V4l2Loopback,
    output_side: bool,
    width: u32,
    height: u32,
) -> Result<SinkFormat, CaptureError> {
    let yuyv = SinkFormat::yuyv(width, height);
    if !output_side {
        sink.configure_capture_side(&yuyv)?;
        return Ok(yuyv);
    }
    match sink.configure(&yuyv) {
        Ok(()) => Ok(yuyv),
        Err(e) => {
            warn!("YUYV rejected ({e}); trying XRGB32");
            let xrgb = SinkFormat {
                pixel_format: OutputPixelFormat::Xrgb32,
                ..yuyv
            };
            sink.configure(&xrgb)?;
            Ok(xrgb)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_device_config() -> CamConfig {
        let mut cfg = CamConfig::default();
        cfg.device.path = std::env::temp_dir()
            .join("portalcam-no-such-device")
            .display()
            .to_string();
        cfg
    }

    #[test]
    fn service_creates_with_defaults() {
        let svc = CamService::new(CamConfig::default());
        assert!(svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = CamService::new(CamConfig::default());
        let handle = svc.stop_handle();
        handle.request(ShutdownReason::SinkFailed);
        assert!(!svc.is_running());
        svc.stop();
        assert_eq!(svc.reason(), ShutdownReason::SinkFailed);
    }

    #[tokio::test]
    async fn pattern_mode_reports_missing_device() {
        let svc = CamService::new(missing_device_config());
        let err = svc.run_pattern().await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Sink(portalcam_core::SinkError::Open { .. })
        ));
    }

    #[cfg(feature = "desktop")]
    #[tokio::test]
    async fn capture_mode_opens_device_before_contacting_portal() {
        let svc = CamService::new(missing_device_config());
        let err = svc.run_capture().await.unwrap_err();
        assert!(matches!(
            err,
            CaptureError::Sink(portalcam_core::SinkError::Open { .. })
        ));
    }

    #[cfg(not(feature = "desktop"))]
    #[tokio::test]
    async fn capture_mode_needs_desktop_feature() {
        let svc = CamService::new(CamConfig::default());
        assert!(matches!(svc.run_capture().await, Err(CaptureError::Stream(_))));
    }
}
