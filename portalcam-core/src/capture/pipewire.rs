//! PipeWire stream adapter.
//!
//! Connects to the remote handed out by the portal, binds the chosen
//! node and forwards stream events into a [`FramePipeline`]. Runs the
//! PipeWire main loop on the calling thread until shutdown is requested,
//! so callers put it on a blocking thread.

use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use pipewire as pw;
use pw::spa;
use pw::spa::param::ParamType;
use pw::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::param::video::{VideoFormat, VideoInfoRaw};
use pw::spa::pod::deserialize::PodDeserializer;
use pw::spa::pod::{self, ChoiceValue, Pod, Value};
use pw::spa::utils::{Choice, ChoiceEnum};
use pw::stream::{Stream, StreamFlags};
use tracing::{debug, error, info};

use crate::capture::buffer::{BufferDescriptor, BufferMemory, Chunk, StreamBuffer, data_type};
use crate::capture::pipeline::{FramePipeline, StreamState};
use crate::capture::sink::DeviceSink;
use crate::capture::types::StreamFormat;
use crate::error::CaptureError;
use crate::flags::DataFlags;
use crate::shutdown::{Shutdown, ShutdownReason};

const STREAM_NAME: &str = "portalcam";
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Stream `node_id` from `remote` into `pipeline` until shutdown.
pub fn run_stream<S: DeviceSink + 'static>(
    remote: OwnedFd,
    node_id: u32,
    pipeline: FramePipeline<S>,
    shutdown: Shutdown,
) -> Result<(), CaptureError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None).map_err(stream_error)?;
    let context = pw::context::Context::new(&mainloop).map_err(stream_error)?;
    let core = context.connect_fd(remote, None).map_err(stream_error)?;

    let stream = Stream::new(
        &core,
        STREAM_NAME,
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )
    .map_err(stream_error)?;

    let _listener = stream
        .add_local_listener_with_user_data(pipeline)
        .state_changed(|_, pipeline, old, new| {
            let (old, _) = map_state(&old);
            let (new, message) = map_state(&new);
            pipeline.on_state_changed(old, new, message);
        })
        .param_changed(|_, pipeline, id, param| {
            let Some(param) = param else {
                return;
            };
            if id == ParamType::Buffers.as_raw() {
                pipeline.on_buffers_offered(buffer_count(param));
                return;
            }
            if id != ParamType::Format.as_raw() {
                return;
            }
            let Some(format) = parse_format(param) else {
                return;
            };
            if let Err(e) = pipeline.on_format_changed(format) {
                error!("failed to apply stream format: {e}");
                let reason = match e {
                    CaptureError::Sink(_) => ShutdownReason::SinkFailed,
                    _ => ShutdownReason::StreamFailed,
                };
                pipeline.shutdown().request(reason);
            }
        })
        .process(|stream, pipeline| {
            if let Some(buffer) = DequeuedBuffer::take(stream) {
                pipeline.process(buffer);
            }
        })
        .register()
        .map_err(stream_error)?;

    let format_pod = enum_format_pod()?;
    let mut params = [Pod::from_bytes(&format_pod)
        .ok_or_else(|| CaptureError::Stream("malformed format pod".into()))?];

    stream
        .connect(
            spa::utils::Direction::Input,
            Some(node_id),
            StreamFlags::AUTOCONNECT | StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(stream_error)?;
    info!(node_id, "stream connected");

    let quit = mainloop.clone();
    let watch = shutdown.clone();
    let timer = mainloop.loop_().add_timer(move |_| {
        if watch.is_requested() {
            quit.quit();
        }
    });
    timer
        .update_timer(Some(SHUTDOWN_POLL), Some(SHUTDOWN_POLL))
        .into_result()
        .map_err(stream_error)?;

    mainloop.run();
    debug!(reason = ?shutdown.reason(), "stream loop stopped");

    stream.disconnect().map_err(stream_error)?;
    Ok(())
}

// ── Format negotiation ───────────────────────────────────────────

/// EnumFormat offering raw video only; the producer picks the layout.
fn enum_format_pod() -> Result<Vec<u8>, CaptureError> {
    let object = pod::object!(
        spa::utils::SpaTypes::ObjectParamFormat,
        ParamType::EnumFormat,
        pod::property!(FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
    );
    let (cursor, _) = pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pod::Value::Object(object),
    )
    .map_err(|e| CaptureError::Stream(format!("format pod: {e:?}")))?;
    Ok(cursor.into_inner())
}

fn parse_format(param: &Pod) -> Option<StreamFormat> {
    let (media_type, media_subtype) = format_utils::parse_format(param).ok()?;
    if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
        return None;
    }
    let mut info = VideoInfoRaw::new();
    if let Err(e) = info.parse(param) {
        debug!("unparseable video format: {e:?}");
        return None;
    }
    let size = info.size();
    let format: VideoFormat = info.format();
    Some(StreamFormat::new(format.as_raw(), size.width, size.height))
}

/// `SPA_PARAM_BUFFERS_buffers` of a Buffers param, fixed or preferred.
fn buffer_count(param: &Pod) -> Option<u32> {
    let (_, value) = PodDeserializer::deserialize_any_from(param.as_bytes()).ok()?;
    let Value::Object(object) = value else {
        return None;
    };
    let property = object
        .properties
        .iter()
        .find(|property| property.key == spa::sys::SPA_PARAM_BUFFERS_buffers)?;
    let count = match &property.value {
        Value::Int(count) => *count,
        Value::Choice(ChoiceValue::Int(Choice(_, choice))) => match choice {
            ChoiceEnum::None(count) => *count,
            ChoiceEnum::Range { default, .. }
            | ChoiceEnum::Step { default, .. }
            | ChoiceEnum::Enum { default, .. }
            | ChoiceEnum::Flags { default, .. } => *default,
        },
        _ => return None,
    };
    u32::try_from(count).ok()
}

fn map_state(state: &pw::stream::StreamState) -> (StreamState, Option<&str>) {
    match state {
        pw::stream::StreamState::Error(message) => (StreamState::Error, Some(message.as_str())),
        pw::stream::StreamState::Unconnected => (StreamState::Unconnected, None),
        pw::stream::StreamState::Connecting => (StreamState::Connecting, None),
        pw::stream::StreamState::Paused => (StreamState::Paused, None),
        pw::stream::StreamState::Streaming => (StreamState::Streaming, None),
    }
}

// ── Buffers ──────────────────────────────────────────────────────

/// First data plane of a dequeued buffer, copied out of `spa_data`.
#[derive(Clone, Copy)]
struct RawPlane {
    kind: u32,
    fd: i64,
    map_offset: u32,
    max_size: u32,
    flags: u32,
    data: *const u8,
    chunk: Chunk,
}

/// A dequeued stream buffer; dropping it queues the buffer back.
struct DequeuedBuffer<'s> {
    _buffer: pw::buffer::Buffer<'s>,
    plane: Option<RawPlane>,
}

impl<'s> DequeuedBuffer<'s> {
    fn take(stream: &'s pw::stream::StreamRef) -> Option<Self> {
        let mut buffer = stream.dequeue_buffer()?;
        let plane = buffer.datas_mut().first_mut().map(|data| {
            let raw = data.as_raw();
            let chunk = data.chunk();
            RawPlane {
                kind: raw.type_,
                fd: raw.fd,
                map_offset: raw.mapoffset,
                max_size: raw.maxsize,
                flags: raw.flags,
                data: raw.data as *const u8,
                chunk: Chunk {
                    offset: chunk.offset(),
                    size: chunk.size(),
                    stride: chunk.stride(),
                },
            }
        });
        Some(Self {
            _buffer: buffer,
            plane,
        })
    }
}

impl StreamBuffer for DequeuedBuffer<'_> {
    fn descriptor(&self) -> Option<BufferDescriptor<'_>> {
        let plane = self.plane?;
        let flags = DataFlags::from_bits_truncate(plane.flags);
        let memory = match plane.kind {
            data_type::DMA_BUF | data_type::MEM_FD if plane.fd >= 0 => {
                // SAFETY: the descriptor belongs to the buffer held in
                // `self` and stays open until it is queued back.
                let fd = unsafe { BorrowedFd::borrow_raw(plane.fd as RawFd) };
                if plane.kind == data_type::DMA_BUF {
                    BufferMemory::DmaBuf {
                        fd,
                        map_offset: plane.map_offset,
                        max_size: plane.max_size,
                        flags,
                    }
                } else {
                    BufferMemory::MemFd {
                        fd,
                        map_offset: plane.map_offset,
                        max_size: plane.max_size,
                        flags,
                    }
                }
            }
            data_type::MEM_PTR if !plane.data.is_null() => {
                // SAFETY: the producer maps `maxsize` bytes at `data` for as
                // long as the buffer is dequeued, which `self` guarantees.
                let data = unsafe { std::slice::from_raw_parts(plane.data, plane.max_size as usize) };
                BufferMemory::MemPtr { data }
            }
            kind => BufferMemory::Unsupported { kind },
        };
        Some(BufferDescriptor {
            memory,
            chunk: plane.chunk,
        })
    }
}

fn stream_error(e: impl std::fmt::Display) -> CaptureError {
    CaptureError::Stream(e.to_string())
}

#[cfg(test)]
mod tests {
    use pw::spa::utils::{ChoiceFlags, SpaTypes};

    use super::*;

    fn buffers_pod(value: Value) -> Vec<u8> {
        let object = pod::Object {
            type_: SpaTypes::ObjectParamBuffers.as_raw(),
            id: ParamType::Buffers.as_raw(),
            properties: vec![pod::Property {
                key: spa::sys::SPA_PARAM_BUFFERS_buffers,
                flags: pod::PropertyFlags::empty(),
                value,
            }],
        };
        let (cursor, _) = pod::serialize::PodSerializer::serialize(
            std::io::Cursor::new(Vec::new()),
            &Value::Object(object),
        )
        .unwrap();
        cursor.into_inner()
    }

    #[test]
    fn buffer_count_reads_range_default() {
        let bytes = buffers_pod(Value::Choice(ChoiceValue::Int(Choice(
            ChoiceFlags::empty(),
            ChoiceEnum::Range {
                default: 8,
                min: 2,
                max: 16,
            },
        ))));
        let pod = Pod::from_bytes(&bytes).unwrap();
        assert_eq!(buffer_count(pod), Some(8));
    }

    #[test]
    fn buffer_count_reads_fixed_value() {
        let bytes = buffers_pod(Value::Int(4));
        assert_eq!(buffer_count(Pod::from_bytes(&bytes).unwrap()), Some(4));
    }

    #[test]
    fn buffer_count_ignores_negative_values() {
        let bytes = buffers_pod(Value::Int(-1));
        assert_eq!(buffer_count(Pod::from_bytes(&bytes).unwrap()), None);
    }
}
