// Control Protocol & Queue Envelope
//
// Dispatcher and workers exchange `Frame`s: a numeric type code plus a
// string payload. Codes 0..=7 are reserved for the control protocol,
// anything else is an application-defined custom message.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::{DomainError, Result};

/// AMQP-style message headers
pub type Headers = BTreeMap<String, serde_json::Value>;

/// Reserved control message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Queue = 0,
    Processed = 1,
    StopSending = 2,
    LastMsg = 3,
    KillMe = 4,
    IQuit = 5,
    RogerThat = 6,
    CustomMessageProcessed = 7,
}

impl MessageType {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(MessageType::Queue),
            1 => Some(MessageType::Processed),
            2 => Some(MessageType::StopSending),
            3 => Some(MessageType::LastMsg),
            4 => Some(MessageType::KillMe),
            5 => Some(MessageType::IQuit),
            6 => Some(MessageType::RogerThat),
            7 => Some(MessageType::CustomMessageProcessed),
            _ => None,
        }
    }

    pub fn is_reserved(code: u32) -> bool {
        Self::from_code(code).is_some()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Queue => write!(f, "QUEUE"),
            MessageType::Processed => write!(f, "PROCESSED"),
            MessageType::StopSending => write!(f, "STOP_SENDING"),
            MessageType::LastMsg => write!(f, "LAST_MSG"),
            MessageType::KillMe => write!(f, "KILL_ME"),
            MessageType::IQuit => write!(f, "I_QUIT"),
            MessageType::RogerThat => write!(f, "ROGER_THAT"),
            MessageType::CustomMessageProcessed => write!(f, "CUSTOM_MESSAGE_PROCESSED"),
        }
    }
}

/// Wire unit exchanged over a worker channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: u32,
    #[serde(default)]
    pub payload: String,
}

impl Frame {
    pub fn new(kind: u32, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Payload-less control frame
    pub fn signal(message_type: MessageType) -> Self {
        Self::new(message_type.code(), String::new())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.kind)
    }
}

/// Broker metadata carried with every queue message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmqpMeta {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    #[serde(default)]
    pub headers: Headers,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub amqp: AmqpMeta,
}

/// Payload of a QUEUE frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEnvelope {
    #[serde(rename = "messageID")]
    pub message_id: String,
    pub meta: EnvelopeMeta,
    #[serde(with = "content_repr")]
    pub content: Vec<u8>,
}

impl QueueEnvelope {
    pub fn new(message_id: impl Into<String>, amqp: AmqpMeta, content: Vec<u8>) -> Self {
        Self {
            message_id: message_id.into(),
            meta: EnvelopeMeta { amqp },
            content,
        }
    }

    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload).map_err(|e| DomainError::MalformedPayload {
            kind: MessageType::Queue.code(),
            reason: e.to_string(),
        })
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| DomainError::Encode(e.to_string()))
    }

    pub fn into_queue_message(self) -> QueueMessage {
        let AmqpMeta {
            exchange,
            queue,
            routing_key,
            headers,
        } = self.meta.amqp;
        QueueMessage {
            message_id: self.message_id,
            exchange,
            queue,
            routing_key,
            headers,
            content: self.content,
        }
    }
}

/// Queue message as seen by a worker's handler
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub headers: Headers,
    pub content: Vec<u8>,
}

impl QueueMessage {
    pub fn content_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }
}

/// Application-defined message with a non-reserved type code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomMessage {
    kind: u32,
    content: String,
}

impl CustomMessage {
    pub fn new(kind: u32, content: impl Into<String>) -> Result<Self> {
        if MessageType::is_reserved(kind) {
            return Err(DomainError::ReservedMessageType(kind));
        }
        Ok(Self {
            kind,
            content: content.into(),
        })
    }

    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn into_frame(self) -> Frame {
        Frame::new(self.kind, self.content)
    }
}

impl TryFrom<Frame> for CustomMessage {
    type Error = DomainError;

    fn try_from(frame: Frame) -> Result<Self> {
        CustomMessage::new(frame.kind, frame.payload)
    }
}

/// Decoded control protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Queue(QueueEnvelope),
    Processed,
    StopSending,
    LastMsg,
    KillMe,
    IQuit,
    RogerThat,
    CustomMessageProcessed,
    Custom(CustomMessage),
}

impl ControlMessage {
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            ControlMessage::Queue(_) => Some(MessageType::Queue),
            ControlMessage::Processed => Some(MessageType::Processed),
            ControlMessage::StopSending => Some(MessageType::StopSending),
            ControlMessage::LastMsg => Some(MessageType::LastMsg),
            ControlMessage::KillMe => Some(MessageType::KillMe),
            ControlMessage::IQuit => Some(MessageType::IQuit),
            ControlMessage::RogerThat => Some(MessageType::RogerThat),
            ControlMessage::CustomMessageProcessed => Some(MessageType::CustomMessageProcessed),
            ControlMessage::Custom(_) => None,
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        match self {
            ControlMessage::Queue(envelope) => {
                Ok(Frame::new(MessageType::Queue.code(), envelope.encode()?))
            }
            ControlMessage::Custom(message) => Ok(message.clone().into_frame()),
            other => {
                let message_type = other.message_type().ok_or_else(|| {
                    DomainError::Internal("control message without a type code".to_string())
                })?;
                Ok(Frame::signal(message_type))
            }
        }
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        let Some(message_type) = frame.message_type() else {
            return CustomMessage::try_from(frame).map(ControlMessage::Custom);
        };
        Ok(match message_type {
            MessageType::Queue => ControlMessage::Queue(QueueEnvelope::decode(&frame.payload)?),
            MessageType::Processed => ControlMessage::Processed,
            MessageType::StopSending => ControlMessage::StopSending,
            MessageType::LastMsg => ControlMessage::LastMsg,
            MessageType::KillMe => ControlMessage::KillMe,
            MessageType::IQuit => ControlMessage::IQuit,
            MessageType::RogerThat => ControlMessage::RogerThat,
            MessageType::CustomMessageProcessed => ControlMessage::CustomMessageProcessed,
        })
    }
}

// Content travels as a JSON string when it is valid UTF-8, as a byte array otherwise.
mod content_repr {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(content: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(content) {
            Ok(text) => text.serialize(serializer),
            Err(_) => content.serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}
