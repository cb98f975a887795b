//! Wire protocol for the tether offloading frontend.
//!
//! The target pushes arguments and requests execution with 4-byte framed
//! messages (1 type byte + 24-bit big-endian value); the host answers with
//! `RESULT` frames. Every inbound frame is preceded by the two-byte `{{`
//! marker so the host can resynchronize after boot noise or a target reset.
//! All multi-byte scalars on the wire are big-endian.

mod codec;
mod message;
pub mod trace;

pub use codec::{read_header, write_execute, write_hello, write_push, write_result};
pub use message::{
    block, opcode, seek, socket, stat, status, Header, HELLO_MAGIC, MAX_OUTPUTS,
    MAX_STRING_LENGTH, SYNC_BYTE, TIMEOUT_INFINITE, TYPE_EXECUTE, TYPE_PUSH, TYPE_RESULT,
};
