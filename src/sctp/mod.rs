//! SCTP-framed covert bytestream inside the DTLS record layer.
//!
//! Stream 0, WebRTC-string payload protocol: what an ordinary WebRTC data
//! channel would look like. The client opens the stream; the server accepts
//! the first one in.

mod assoc;
mod chunk;

pub use assoc::SctpConn;
pub use chunk::{Chunk, PPID_WEBRTC_STRING, STREAM_ID};
