//! Lanchat wire grammar: colon-separated text lines, one message per line.

/// Id used for engine-originated lines that no peer acks.
pub const NULL_ID: &str = "NULL_ID";

/// Third field of a `TEXT` line marking an echo of locally-sent text.
const SENDER_MARK: &str = "SENDER";

/// All inbound message types. Framing is newline-delimited UTF-8 text; a
/// `FileStart` switches the connection into binary mode for exactly `size`
/// raw payload bytes (see the framing module).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Control traffic, forwarded or buffered verbatim.
    Ctrl { id: String, raw: String },
    /// Chat text, forwarded or buffered verbatim. `sender_echo` is set when
    /// the line is an echo of text this device sent.
    Text {
        id: String,
        sender_echo: bool,
        raw: String,
    },
    /// Liveness probe; acked, no other side effect.
    Ping { id: String },
    /// Header of a raw binary payload of exactly `size` bytes.
    FileStart {
        id: String,
        filename: String,
        size: u64,
    },
}

impl Message {
    /// Parse one line (without the trailing newline). Fewer than two fields
    /// or an unknown type tag is fatal to the connection.
    pub fn parse(line: &str) -> Result<Message, ParseError> {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 2 {
            return Err(ParseError::TooFewFields);
        }
        let id = fields[1].to_string();
        match fields[0] {
            "CTRL" => Ok(Message::Ctrl {
                id,
                raw: line.to_string(),
            }),
            "TEXT" => Ok(Message::Text {
                id,
                sender_echo: fields.get(2).copied() == Some(SENDER_MARK),
                raw: line.to_string(),
            }),
            "PING" => Ok(Message::Ping { id }),
            "FILE_START" => {
                if fields.len() != 4 {
                    return Err(ParseError::BadFileStart);
                }
                let size = fields[3]
                    .parse::<u64>()
                    .map_err(|_| ParseError::BadFileSize(fields[3].to_string()))?;
                Ok(Message::FileStart {
                    id,
                    filename: fields[2].to_string(),
                    size,
                })
            }
            other => Err(ParseError::UnknownType(other.to_string())),
        }
    }

    /// The id token the ack for this message correlates to.
    pub fn id(&self) -> &str {
        match self {
            Message::Ctrl { id, .. }
            | Message::Text { id, .. }
            | Message::Ping { id }
            | Message::FileStart { id, .. } => id,
        }
    }
}

/// Ack status: terminal for line messages, a running byte count for files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Done,
    Progress(u64),
}

/// Render an ack line, trailing newline included.
pub fn encode_ack(id: &str, status: AckStatus) -> String {
    match status {
        AckStatus::Done => format!("ACK:{id}:DONE\n"),
        AckStatus::Progress(n) => format!("ACK:{id}:{n}\n"),
    }
}

/// Render the identity line sent down fresh connections when a device
/// identity is configured.
pub fn identity_line(hostname: &str, token: &str) -> String {
    format!("TEXT:{NULL_ID}:PN_INFO:{hostname} {token}\n")
}

/// Render the local-only file-completion line delivered to the consumer.
pub fn file_end_line(id: &str, path: &str) -> String {
    format!("FILE_END:{id}:{path}")
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("message has fewer than two fields")]
    TooFewFields,
    #[error("unrecognized message type '{0}'")]
    UnknownType(String),
    #[error("FILE_START expects id, filename and size fields")]
    BadFileStart,
    #[error("invalid file size '{0}'")]
    BadFileSize(String),
}
