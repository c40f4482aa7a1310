//! Length-delimited frame reassembly.
//!
//! Turns an unbounded byte stream into a sequence of complete frames. The
//! reassembler is a pure byte-to-frame transform and holds no knowledge of
//! package semantics; emitted frames include their 4-byte length prefix and
//! are handed to [`Package::decode`](crate::package::Package::decode) by the
//! transport layer.

use bytes::{Bytes, BytesMut};

use crate::error::{Result, WireError};
use crate::package::LENGTH_PREFIX_SIZE;

/// Default bound on a single package's declared content length: 64 MiB.
pub const DEFAULT_MAX_PACKAGE_SIZE: usize = 64 * 1024 * 1024;

/// Reassembles complete length-prefixed frames from arbitrary byte chunks.
///
/// Internal state is an accumulation buffer and a target length (zero until
/// the prefix of the frame in progress has been seen). A declared length
/// beyond `max_package_size` is a fatal framing error; the owning connection
/// must close, since the stream can no longer be trusted to be in sync.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    target: usize,
    max_package_size: usize,
}

impl FrameReassembler {
    /// Creates a reassembler with the given content-length bound.
    pub fn new(max_package_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            target: 0,
            max_package_size,
        }
    }

    /// Appends a chunk and emits every frame it completes, in order.
    ///
    /// Several frames arriving in one read are all emitted; a partial frame
    /// is held until later chunks complete it. On error the reassembler is
    /// poisoned and must be discarded along with its connection.
    pub fn process<F>(&mut self, chunk: &[u8], sink: &mut F) -> Result<()>
    where
        F: FnMut(Bytes),
    {
        self.buffer.extend_from_slice(chunk);
        loop {
            if self.buffer.len() < LENGTH_PREFIX_SIZE {
                return Ok(());
            }
            if self.target == 0 {
                let declared = u32::from_le_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                if declared > self.max_package_size {
                    return Err(WireError::PackageTooLarge {
                        size: declared,
                        max_size: self.max_package_size,
                    });
                }
                self.target = declared + LENGTH_PREFIX_SIZE;
            }
            if self.buffer.len() < self.target {
                return Ok(());
            }
            let frame = self.buffer.split_to(self.target).freeze();
            self.target = 0;
            sink(frame);
        }
    }

    /// Number of buffered bytes belonging to an incomplete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKAGE_SIZE)
    }
}
