/// Video decoding: packet-queue consumer feeding a single-slot frame
/// buffer with latest-wins semantics
pub mod decoder;
pub mod delay_buffer;

pub use decoder::VideoDecoder;
pub use delay_buffer::{DelayBuffer, VideoFrame};
