//! Frame intake: wire decoding and the WebSocket source.

pub mod frame;
pub mod websocket;

pub use frame::{
    decode_frame, decode_frame_bytes, DecodeError, DeviceInfo, Frame, Heartbeat, SampleFrame,
    UNKNOWN_DEVICE,
};
pub use websocket::WsSource;
