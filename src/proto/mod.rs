//! Wire protocol: SMTP envelope + binary frames

pub mod frames;
pub mod smtp;

pub use frames::{Frame, FrameCodec, FrameType, CHUNK_SIZE, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
