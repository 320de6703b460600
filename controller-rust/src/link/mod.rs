//! Serial link layer: transport, bus arbiter, typed board operations, and
//! the event demultiplexer.

pub mod board;
pub mod bus;
pub mod events;
pub mod transport;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("timed out waiting for response type 0x{expected:02x}")]
    Timeout { expected: u8 },
    #[error("request skipped by a higher-priority command")]
    Skipped,
    #[error("bus busy: could not acquire the request slot in time")]
    Busy,
    #[error("link I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub use board::{BoardController, SoundKind};
pub use bus::{Bus, LinkEvent};
pub use events::{start_demux, InputEvent};
