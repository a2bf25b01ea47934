//! Integration tests: portal handshake into the frame pipeline, end-to-end
//! conversion to the device, and output-failure bookkeeping.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use portalcam_core::capture::buffer::{BufferDescriptor, BufferMemory, Chunk, StreamBuffer};
use portalcam_core::capture::sink::{DeviceSink, OutputPixelFormat, SinkFormat};
use portalcam_core::portal::session::{HandshakeStep, SessionPhase};
use portalcam_core::portal::{
    PortalEvent, PortalRequest, PortalResponse, ResponseResults, StreamProperties,
    monitor_session,
};
use portalcam_core::{
    BufferImporter, FrameOutcome, FramePipeline, Negotiator, PipelineConfig, PixelLayout,
    PortalBus, PortalError, SessionLiveness, Shutdown, ShutdownReason, SinkError,
    SourceSelection, StreamFormat,
};

// ── Helpers ──────────────────────────────────────────────────────

const SESSION: &str = "/org/freedesktop/portal/desktop/session/1_7/portalcam_0_0";
const NODE_ID: u32 = 57;

/// Device double: records frames, fails writes while `failing` is set.
#[derive(Debug, Default)]
struct MemoryDevice {
    formats: Vec<SinkFormat>,
    frames: Vec<Vec<u8>>,
    failing: Arc<AtomicBool>,
}

impl DeviceSink for MemoryDevice {
    fn configure(&mut self, format: &SinkFormat) -> Result<(), SinkError> {
        self.formats.push(*format);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.frames.push(frame.to_vec());
        Ok(frame.len())
    }
}

/// A mapped buffer of uniform pixels; counts how often it is requeued.
struct UniformBuffer {
    data: Vec<u8>,
    stride: i32,
    requeued: Rc<Cell<usize>>,
}

impl StreamBuffer for UniformBuffer {
    fn descriptor(&self) -> Option<BufferDescriptor<'_>> {
        Some(BufferDescriptor {
            memory: BufferMemory::MemPtr { data: &self.data },
            chunk: Chunk {
                offset: 0,
                size: self.data.len() as u32,
                stride: self.stride,
            },
        })
    }
}

impl Drop for UniformBuffer {
    fn drop(&mut self) {
        self.requeued.set(self.requeued.get() + 1);
    }
}

fn uniform_frame(width: u32, height: u32, pixel: [u8; 4], requeued: &Rc<Cell<usize>>) -> UniformBuffer {
    UniformBuffer {
        data: pixel.repeat((width * height) as usize),
        stride: (width * 4) as i32,
        requeued: Rc::clone(requeued),
    }
}

/// Portal double answering every request from a script.
struct ScriptedPortal {
    sent: Vec<PortalRequest>,
    queue: VecDeque<PortalEvent>,
    fail_at: Option<(HandshakeStep, u32)>,
}

impl ScriptedPortal {
    fn new() -> Self {
        Self {
            sent: Vec::new(),
            queue: VecDeque::new(),
            fail_at: None,
        }
    }

    fn failing_at(step: HandshakeStep, status: u32) -> Self {
        Self {
            fail_at: Some((step, status)),
            ..Self::new()
        }
    }
}

fn step_of(request: &PortalRequest) -> HandshakeStep {
    match request {
        PortalRequest::CreateSession { .. } => HandshakeStep::CreateSession,
        PortalRequest::SelectSources { .. } => HandshakeStep::SelectSources,
        PortalRequest::Start { .. } => HandshakeStep::Start,
        PortalRequest::OpenPipeWireRemote { .. } => HandshakeStep::OpenPipeWireRemote,
    }
}

#[async_trait]
impl PortalBus for ScriptedPortal {
    async fn request(&mut self, request: PortalRequest) -> Result<(), PortalError> {
        let step = step_of(&request);
        let response = match self.fail_at {
            Some((failing, status)) if failing == step => PortalResponse::failure(status),
            _ => PortalResponse::success(match step {
                HandshakeStep::CreateSession => ResponseResults {
                    session_handle: Some(SESSION.into()),
                    ..Default::default()
                },
                HandshakeStep::SelectSources => ResponseResults::default(),
                HandshakeStep::Start => ResponseResults {
                    streams: Some(vec![StreamProperties::new(NODE_ID)]),
                    ..Default::default()
                },
                HandshakeStep::OpenPipeWireRemote => ResponseResults {
                    remote: Some(OwnedFd::from(File::open("/dev/null").unwrap())),
                    ..Default::default()
                },
            }),
        };
        self.queue.push_back(PortalEvent::Response {
            token: request.handle_token().to_string(),
            response,
        });
        self.sent.push(request);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<PortalEvent, PortalError> {
        self.queue
            .pop_front()
            .ok_or_else(|| PortalError::Bus("portal script exhausted".into()))
    }
}

fn active_liveness() -> SessionLiveness {
    let liveness = SessionLiveness::new();
    liveness.set_active(true);
    liveness
}

fn new_pipeline(
    device: MemoryDevice,
    liveness: SessionLiveness,
    shutdown: Shutdown,
) -> FramePipeline<MemoryDevice> {
    FramePipeline::new(
        device,
        BufferImporter::new(),
        &PipelineConfig::default(),
        liveness,
        shutdown,
    )
}

// ── End-to-end conversion ────────────────────────────────────────

#[test]
fn red_xrgb_stream_reaches_device_as_yuyv() {
    let (width, height) = (640, 480);
    let requeued = Rc::new(Cell::new(0));
    let mut pipeline = new_pipeline(MemoryDevice::default(), active_liveness(), Shutdown::new());

    pipeline
        .on_format_changed(StreamFormat::new(PixelLayout::Xrgb.as_raw(), width, height))
        .unwrap();

    let red = [0xFF, 255, 0, 0];
    for _ in 0..5 {
        let outcome = pipeline.process(uniform_frame(width, height, red, &requeued));
        assert!(matches!(outcome, FrameOutcome::WarmingUp));
    }
    let outcome = pipeline.process(uniform_frame(width, height, red, &requeued));
    assert!(matches!(outcome, FrameOutcome::Written { bytes: 614_400 }));

    let device = pipeline.sink();
    assert_eq!(device.formats, vec![SinkFormat::yuyv(width, height)]);
    assert_eq!(device.formats[0].pixel_format, OutputPixelFormat::Yuyv);
    assert_eq!(device.frames.len(), 1);

    let frame = &device.frames[0];
    assert_eq!(frame.len(), (width * height * 2) as usize);
    assert!(frame.chunks_exact(4).all(|mp| mp == [82, 90, 82, 240]));
    assert_eq!(requeued.get(), 6);
}

#[test]
fn padded_rows_convert_like_tight_rows() {
    let (width, height) = (6, 4);
    let requeued = Rc::new(Cell::new(0));
    let pixel = [0, 10, 200, 30];

    let mut tight = new_pipeline(MemoryDevice::default(), active_liveness(), Shutdown::new());
    let mut padded = new_pipeline(MemoryDevice::default(), active_liveness(), Shutdown::new());
    let format = StreamFormat::new(PixelLayout::Xrgb.as_raw(), width, height);
    tight.on_format_changed(format).unwrap();
    padded.on_format_changed(format).unwrap();

    let stride = width * 4 + 8;
    for _ in 0..6 {
        tight.process(uniform_frame(width, height, pixel, &requeued));
        let mut data = Vec::new();
        for _ in 0..height {
            data.extend(pixel.repeat(width as usize));
            data.extend([0xEE; 8]);
        }
        padded.process(UniformBuffer {
            data,
            stride: stride as i32,
            requeued: Rc::clone(&requeued),
        });
    }

    assert_eq!(tight.sink().frames.len(), 1);
    assert_eq!(tight.sink().frames, padded.sink().frames);
    assert_eq!(padded.format().map(|f| f.stride), Some(stride));
}

// ── Portal handshake into the pipeline ───────────────────────────

#[tokio::test]
async fn negotiated_session_streams_until_broker_closes_it() {
    let mut portal = ScriptedPortal::new();
    let shutdown = Shutdown::new();
    let mut negotiator = Negotiator::new(SourceSelection::default(), SessionLiveness::new());

    let live = negotiator.run(&mut portal, &shutdown).await.unwrap();
    assert_eq!(live.node_id, NODE_ID);
    assert_eq!(live.session_handle, SESSION);
    assert_eq!(negotiator.phase(), SessionPhase::Ready);
    assert_eq!(portal.sent.len(), 4);

    let requeued = Rc::new(Cell::new(0));
    let device = MemoryDevice::default();
    let failing = Arc::clone(&device.failing);
    let mut pipeline = new_pipeline(device, live.liveness.clone(), shutdown.clone());
    pipeline
        .on_format_changed(StreamFormat::new(PixelLayout::Xrgb.as_raw(), 8, 8))
        .unwrap();
    for _ in 0..6 {
        pipeline.process(uniform_frame(8, 8, [0, 255, 255, 255], &requeued));
    }
    assert_eq!(pipeline.stats().written, 1);

    // The broker closes the session; the monitor flips liveness and stops.
    portal.queue.push_back(PortalEvent::SessionClosed {
        session: SESSION.into(),
    });
    monitor_session(&mut portal, SESSION, live.liveness.clone(), shutdown.clone()).await;
    assert!(!live.liveness.is_active());
    assert_eq!(shutdown.reason(), Some(ShutdownReason::SessionClosed));
    assert!(ShutdownReason::SessionClosed.is_clean());

    // With the session gone, the first failed write ends the run.
    failing.store(true, Ordering::SeqCst);
    let outcome = pipeline.process(uniform_frame(8, 8, [0, 255, 255, 255], &requeued));
    assert!(matches!(
        outcome,
        FrameOutcome::WriteFailed {
            consecutive: 1,
            shutdown: true
        }
    ));
    assert_eq!(shutdown.reason(), Some(ShutdownReason::SessionClosed));
    assert_eq!(requeued.get(), 7);
}

#[tokio::test]
async fn cancelled_source_dialog_fails_the_handshake() {
    let mut portal = ScriptedPortal::failing_at(HandshakeStep::SelectSources, 1);
    let shutdown = Shutdown::new();
    let liveness = SessionLiveness::new();
    let mut negotiator = Negotiator::new(SourceSelection::default(), liveness.clone());

    let err = negotiator.run(&mut portal, &shutdown).await.unwrap_err();
    assert!(matches!(
        err,
        PortalError::RequestFailed {
            step: HandshakeStep::SelectSources,
            status: 1
        }
    ));
    assert_eq!(negotiator.phase(), SessionPhase::Failed);
    assert_eq!(portal.sent.len(), 2);
    assert!(!liveness.is_active());
    assert_eq!(shutdown.reason(), Some(ShutdownReason::HandshakeFailed));
    assert!(!ShutdownReason::HandshakeFailed.is_clean());
}

// ── Output failures ──────────────────────────────────────────────

#[test]
fn failing_device_stops_after_five_consecutive_writes() {
    let requeued = Rc::new(Cell::new(0));
    let shutdown = Shutdown::new();
    let device = MemoryDevice::default();
    device.failing.store(true, Ordering::SeqCst);
    let mut pipeline = new_pipeline(device, active_liveness(), shutdown.clone());
    pipeline
        .on_format_changed(StreamFormat::new(PixelLayout::Bgrx.as_raw(), 4, 4))
        .unwrap();
    for _ in 0..5 {
        pipeline.process(uniform_frame(4, 4, [40, 80, 120, 0], &requeued));
    }

    for expected in 1..=4 {
        let outcome = pipeline.process(uniform_frame(4, 4, [40, 80, 120, 0], &requeued));
        assert!(matches!(
            outcome,
            FrameOutcome::WriteFailed { consecutive, shutdown: false } if consecutive == expected
        ));
        assert!(!shutdown.is_requested());
    }
    let outcome = pipeline.process(uniform_frame(4, 4, [40, 80, 120, 0], &requeued));
    assert!(matches!(
        outcome,
        FrameOutcome::WriteFailed {
            consecutive: 5,
            shutdown: true
        }
    ));
    assert_eq!(shutdown.reason(), Some(ShutdownReason::SinkFailed));
    assert_eq!(pipeline.stats().write_failures, 5);
    assert_eq!(requeued.get(), 10);
}
