//! Caret echo protocol processing.
//!
//! Byte-oriented protocol with no length prefixes:
//!
//! ```text
//! server -> client   '*'                 once, right after accept
//! client -> server   ... ^ payload $ ... bytes outside ^...$ are ignored
//! server -> client   payload + 1         each payload byte incremented (mod 256)
//! ```
//!
//! The machine is fed one byte at a time and holds no other state, so the
//! output never depends on how the input stream was split into chunks.

use crate::runtime::buffer::{BufferOverflow, SendBuffer};

/// Byte sent to every client once its connection is accepted.
pub const GREETING: u8 = b'*';

/// Opens a message.
pub const MESSAGE_START: u8 = b'^';

/// Closes a message.
pub const MESSAGE_END: u8 = b'$';

/// Server-side protocol state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    /// Greeting queued but not yet fully transmitted.
    GreetingPending,
    /// Between messages; waiting for `^`.
    AwaitingMessageStart,
    /// Inside `^...$`; every byte is echoed incremented.
    InMessage,
}

impl ProtocolState {
    /// Advance by one input byte, returning the byte to emit, if any.
    pub fn step(&mut self, byte: u8) -> Option<u8> {
        match *self {
            ProtocolState::GreetingPending => {
                debug_assert!(false, "input fed before greeting was sent");
                None
            }
            ProtocolState::AwaitingMessageStart => {
                if byte == MESSAGE_START {
                    *self = ProtocolState::InMessage;
                }
                None
            }
            ProtocolState::InMessage => {
                if byte == MESSAGE_END {
                    *self = ProtocolState::AwaitingMessageStart;
                    None
                } else {
                    Some(byte.wrapping_add(1))
                }
            }
        }
    }
}

/// Fold `input` through the machine, queueing output into `out`.
///
/// Returns the number of bytes queued. On overflow, processing stops at the
/// byte that did not fit; bytes queued before it stay in `out`.
pub fn process_chunk(
    state: &mut ProtocolState,
    input: &[u8],
    out: &mut SendBuffer,
) -> Result<usize, BufferOverflow> {
    let mut emitted = 0;
    for &byte in input {
        if let Some(reply) = state.step(byte) {
            out.push(reply)?;
            emitted += 1;
        }
    }
    Ok(emitted)
}
