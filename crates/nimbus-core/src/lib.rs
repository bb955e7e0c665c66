//! nimbus-core — chunk codec, wire format, configuration, and socket
//! helpers shared by every nimbus process role.

pub mod chunk;
pub mod config;
pub mod net;
pub mod wire;

pub use chunk::{Chunk, CodecError, CHUNK_MAX_LEN};
pub use config::{ConfigError, NimbusConfig};
pub use wire::{Destination, MsgCode, WireError};
