//! Lanchat transport protocol reference implementation.
//! Host-driven: no I/O; the daemon feeds bytes and fields in and performs the
//! returned steps.

pub mod cgnat;
pub mod device;
pub mod dns;
pub mod engine;
pub mod framing;
pub mod protocol;
pub mod transfer;

pub use device::Device;
pub use engine::{dispatch, Step};
pub use framing::RecvBuffer;
pub use protocol::{encode_ack, AckStatus, Message, ParseError};
pub use transfer::FileTransfer;
