//! In-memory pipe transport for controller-worker IPC.
//!
//! One `tokio::io::duplex` pipe per worker. The parent end writes message
//! frames and reads responses; the child end does the opposite.

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::JsonCodec;
use super::protocol::Response;

/// Bytes buffered in each direction before writers wait for the reader.
pub const PIPE_CAPACITY: usize = 64 * 1024;

pub type MessageWriter = FramedWrite<WriteHalf<DuplexStream>, JsonCodec<serde_json::Value>>;
pub type MessageReader = FramedRead<ReadHalf<DuplexStream>, JsonCodec<serde_json::Value>>;
pub type ResponseWriter = FramedWrite<WriteHalf<DuplexStream>, JsonCodec<Response>>;
pub type ResponseReader = FramedRead<ReadHalf<DuplexStream>, JsonCodec<Response>>;

/// Controller end of the pipe.
#[derive(Debug)]
pub struct ParentTransport {
    stream: DuplexStream,
    max_frame_length: usize,
}

/// Worker end of the pipe, handed to a [`WorkerSpawner`](crate::WorkerSpawner).
#[derive(Debug)]
pub struct ChildTransport {
    stream: DuplexStream,
    max_frame_length: usize,
}

/// Create both ends of a fresh pipe.
pub fn create_transport(max_frame_length: usize) -> (ParentTransport, ChildTransport) {
    let (parent, child) = tokio::io::duplex(PIPE_CAPACITY);
    tracing::debug!(
        capacity = PIPE_CAPACITY,
        max_frame_length,
        "Creating worker transport"
    );
    (
        ParentTransport {
            stream: parent,
            max_frame_length,
        },
        ChildTransport {
            stream: child,
            max_frame_length,
        },
    )
}

impl ParentTransport {
    pub fn into_framed(self) -> (MessageWriter, ResponseReader) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            FramedWrite::new(
                write_half,
                JsonCodec::with_max_frame_length(self.max_frame_length),
            ),
            FramedRead::new(
                read_half,
                JsonCodec::with_max_frame_length(self.max_frame_length),
            ),
        )
    }
}

impl ChildTransport {
    pub fn into_framed(self) -> (MessageReader, ResponseWriter) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            FramedRead::new(
                read_half,
                JsonCodec::with_max_frame_length(self.max_frame_length),
            ),
            FramedWrite::new(
                write_half,
                JsonCodec::with_max_frame_length(self.max_frame_length),
            ),
        )
    }
}
