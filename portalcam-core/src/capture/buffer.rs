//! Stream buffer descriptors as delivered by the transport.
//!
//! A descriptor only borrows the transport's memory; it lives for a
//! single pass through the pipeline.

use std::os::fd::BorrowedFd;

use crate::flags::DataFlags;

/// SPA data type ids (`enum spa_data_type`).
pub mod data_type {
    pub const MEM_PTR: u32 = 1;
    pub const MEM_FD: u32 = 2;
    pub const DMA_BUF: u32 = 3;
}

/// Where a buffer's pixels live.
#[derive(Debug, Clone, Copy)]
pub enum BufferMemory<'a> {
    /// GPU memory exported as a dma-buf.
    DmaBuf {
        fd: BorrowedFd<'a>,
        map_offset: u32,
        max_size: u32,
        flags: DataFlags,
    },
    /// Shared memory behind a file descriptor.
    MemFd {
        fd: BorrowedFd<'a>,
        map_offset: u32,
        max_size: u32,
        flags: DataFlags,
    },
    /// Memory already mapped into this process.
    MemPtr { data: &'a [u8] },
    /// Any other memory kind.
    Unsupported { kind: u32 },
}

impl BufferMemory<'_> {
    pub fn kind(&self) -> u32 {
        match self {
            BufferMemory::MemPtr { .. } => data_type::MEM_PTR,
            BufferMemory::MemFd { .. } => data_type::MEM_FD,
            BufferMemory::DmaBuf { .. } => data_type::DMA_BUF,
            BufferMemory::Unsupported { kind } => *kind,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BufferMemory::MemPtr { .. } => "MemPtr",
            BufferMemory::MemFd { .. } => "MemFd",
            BufferMemory::DmaBuf { .. } => "DmaBuf",
            BufferMemory::Unsupported { .. } => "unsupported",
        }
    }
}

/// Valid-data window reported for the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of the first pixel from the start of the memory.
    pub offset: u32,
    /// Bytes of valid data.
    pub size: u32,
    /// Row pitch; zero or negative when the producer did not report one.
    pub stride: i32,
}

/// A single plane of a stream buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor<'a> {
    pub memory: BufferMemory<'a>,
    pub chunk: Chunk,
}

/// A buffer dequeued from the stream transport.
///
/// Dropping the value returns the buffer to the transport. The pipeline
/// takes buffers by value, so every exit path of a frame pass requeues.
pub trait StreamBuffer {
    /// The first data plane, if the buffer has one.
    fn descriptor(&self) -> Option<BufferDescriptor<'_>>;
}

/// Picks the row pitch for a buffer.
///
/// Prefers the chunk stride, then `size / height`, then the tight row
/// length. The result is never below the tight row length.
pub fn resolve_stride(chunk: &Chunk, width: u32, height: u32, bytes_per_pixel: usize) -> u32 {
    let tight = width * bytes_per_pixel as u32;
    let reported = if chunk.stride > 0 {
        chunk.stride as u32
    } else if chunk.size > 0 && height > 0 {
        chunk.size / height
    } else {
        tight
    };
    reported.max(tight)
}
