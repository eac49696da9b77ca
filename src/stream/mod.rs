//! Capture-side protocol decoding
//!
//! The pieces that turn reassembled TCP bytes into events: the directional
//! reassembly buffer, MySQL wire framing, payload codecs, and the
//! per-connection state machine that pairs the two directions of a flow.

pub mod buffer;
pub mod codec;
pub mod conn;
pub mod frame;
pub mod state;

pub use buffer::DirectionalBuffer;
pub use conn::ConnId;
pub use frame::{Frame, FrameRead, MAX_LOGICAL_PACKET};
pub use state::{EventHandler, FactoryOptions, MySqlStream};
