//! Message dispatch: one step value per message kind; the host performs the
//! side effects.

use crate::protocol::Message;
use crate::transfer::FileTransfer;

/// What the connection driver does with a parsed message. Every arm of the
/// dispatch is a pure function of the message fields.
#[derive(Debug)]
pub enum Step {
    /// Forward the raw line to the consumer (or the offline buffer) and ack
    /// `DONE`. `notify` marks the line as eligible for a new-message
    /// notification; the host combines it with app foreground state.
    Deliver { line: String, notify: bool },
    /// Ack `DONE`, nothing else.
    Pong,
    /// Switch to binary mode and receive the declared payload.
    BeginFile(FileTransfer),
}

/// Map a message to its step. `CTRL` never notifies; `TEXT` notifies unless
/// it is an echo of locally-sent text.
pub fn dispatch(msg: Message) -> Step {
    match msg {
        Message::Ctrl { raw, .. } => Step::Deliver {
            line: raw,
            notify: false,
        },
        Message::Text {
            raw, sender_echo, ..
        } => Step::Deliver {
            line: raw,
            notify: !sender_echo,
        },
        Message::Ping { .. } => Step::Pong,
        Message::FileStart { id, filename, size } => {
            Step::BeginFile(FileTransfer::new(id, filename, size))
        }
    }
}
