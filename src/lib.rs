//! shellgate: interactive shell sessions bridged over WebSocket
//!
//! Each authorized connection gets its own PTY-backed shell. Bytes from the
//! client are written to the shell's terminal input and everything the shell
//! prints is streamed back, until either side goes away.

pub mod config;
pub mod error;
pub mod gate;
pub mod process;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use gate::ConnectionGate;
pub use session::{Session, SessionRegistry};
