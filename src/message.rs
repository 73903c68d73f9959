//! The bus message and its wire codec.
//!
//! Wire form: `sender_id,receiver_id,kind_id,payload\n`. The payload is everything
//! after the third delimiter, so payload sub-fields may themselves be comma separated.

use crate::agents::{AgentId, MessageKind};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};

pub const FIELD_DELIMITER: char = ',';
pub const TERMINATOR: char = '\n';
/// sender, receiver, kind, payload (possibly empty)
pub const MIN_FIELDS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: AgentId,
    pub receiver: AgentId,
    pub kind: MessageKind,
    pub payload: String,
}

impl Message {
    pub fn new(
        sender: AgentId,
        receiver: AgentId,
        kind: MessageKind,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            receiver,
            kind,
            payload: payload.into(),
        }
    }

    pub fn terminate(sender: AgentId, receiver: AgentId) -> Self {
        Self::new(sender, receiver, MessageKind::TERMINATE, "")
    }

    pub fn heartbeat(sender: AgentId, receiver: AgentId) -> Self {
        Self::new(sender, receiver, MessageKind::HEARTBEAT, "")
    }

    /// Payload sub-fields split on the field delimiter.
    pub fn fields(&self) -> core::str::Split<'_, char> {
        self.payload.split(FIELD_DELIMITER)
    }
}

/// Pack a message into a single terminated line.
///
/// Terminator characters cannot travel inside a payload; they are replaced by spaces.
pub fn pack(msg: &Message) -> String {
    let mut line = String::with_capacity(msg.payload.len() + 16);
    line.push_str(&msg.sender.id().to_string());
    line.push(FIELD_DELIMITER);
    line.push_str(&msg.receiver.id().to_string());
    line.push(FIELD_DELIMITER);
    line.push_str(&msg.kind.0.to_string());
    line.push(FIELD_DELIMITER);
    line.extend(
        msg.payload
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c }),
    );
    line.push(TERMINATOR);
    line
}

/// Unpack one line. Never panics; every malformed input is an explicit error.
pub fn unpack(raw: &str) -> Result<Message, CodecError> {
    let line = raw.trim_end_matches(['\n', '\r']);
    let fields: heapless::Vec<&str, MIN_FIELDS> = {
        let mut v = heapless::Vec::new();
        for field in line.splitn(MIN_FIELDS, FIELD_DELIMITER) {
            // splitn never yields more than MIN_FIELDS items
            let _ = v.push(field);
        }
        v
    };

    if fields.len() < MIN_FIELDS {
        return Err(CodecError::TooFewFields {
            expected: MIN_FIELDS,
            found: fields.len(),
        });
    }

    let sender = parse_agent("sender", fields[0])?;
    let receiver = parse_agent("receiver", fields[1])?;
    let kind = parse_number("kind", fields[2])
        .and_then(|n| {
            u16::try_from(n).map_err(|_| CodecError::NonNumeric {
                field: "kind",
                value: fields[2].to_string(),
            })
        })
        .map(MessageKind)?;

    Ok(Message {
        sender,
        receiver,
        kind,
        payload: fields[3].to_string(),
    })
}

fn parse_number(field: &'static str, value: &str) -> Result<u32, CodecError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::NonNumeric {
            field,
            value: value.to_string(),
        });
    }
    value.parse::<u32>().map_err(|_| CodecError::NonNumeric {
        field,
        value: value.to_string(),
    })
}

fn parse_agent(field: &'static str, value: &str) -> Result<AgentId, CodecError> {
    let id = parse_number(field, value)?;
    AgentId::from_id(id).ok_or(CodecError::UnknownAgent { field, id })
}
