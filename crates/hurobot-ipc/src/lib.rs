//! Hurobot IPC
//!
//! Message segment model, raw CQ rendering, and the event bus between the
//! transport adapter and the command runtime

pub mod cq;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use tokio::sync::broadcast;

pub type UserId = u64;
pub type GroupId = u64;
pub type MessageId = u64;

/// One typed unit of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Segment {
    Text(String),
    Mention(UserId),
    Face(u32),
    Image { url: String },
    Voice { file: String },
    Reply(MessageId),
    File { file: String },
    Forward { id: String },
    OpaqueJson(String),
}

impl Segment {
    pub fn text(content: impl Into<String>) -> Self {
        Segment::Text(content.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Segment::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Reply references and mentions that clients put in front of typed text.
    pub fn is_prefix(&self) -> bool {
        matches!(self, Segment::Reply(_) | Segment::Mention(_))
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = String::new();
        cq::render_segment(self, &mut raw);
        f.write_str(&raw)
    }
}

/// Inbound chat message. `group_id == 0` marks a private conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Message {
    #[serde(default)]
    pub message_id: MessageId,
    pub user_id: UserId,
    #[serde(default)]
    pub group_id: GroupId,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub time: i64,
    pub segments: Vec<Segment>,
    pub raw: String,
    /// Byte range of each segment inside `raw`, parallel to `segments`.
    /// Empty when the transport did not provide offsets.
    #[serde(default)]
    pub spans: Vec<Range<usize>>,
}

impl Message {
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let (segments, spans) = cq::parse(&raw);
        Self {
            segments,
            raw,
            spans,
            ..Self::default()
        }
    }

    pub fn from_segments(segments: Vec<Segment>) -> Self {
        let (raw, spans) = cq::render(&segments);
        Self {
            segments,
            raw,
            spans,
            ..Self::default()
        }
    }

    pub fn with_sender(mut self, user_id: UserId, group_id: GroupId) -> Self {
        self.user_id = user_id;
        self.group_id = group_id;
        self
    }

    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = nickname.into();
        self
    }

    pub fn with_time(mut self, time: i64) -> Self {
        self.time = time;
        self
    }

    /// Drops the span table, leaving only the raw rendering.
    pub fn without_spans(mut self) -> Self {
        self.spans.clear();
        self
    }

    pub fn is_private(&self) -> bool {
        self.group_id == 0
    }

    /// Byte range of segment `index` inside `raw`, if offsets are known and sane.
    pub fn span(&self, index: usize) -> Option<Range<usize>> {
        if self.spans.len() != self.segments.len() {
            return None;
        }
        let span = self.spans.get(index)?.clone();
        (span.start <= span.end && self.raw.get(span.clone()).is_some()).then_some(span)
    }

    /// Where replies to this message go.
    pub fn reply_target(&self) -> Target {
        if self.is_private() {
            Target::Private(self.user_id)
        } else {
            Target::Group(self.group_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Target {
    Group(GroupId),
    Private(UserId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OutboundMessage {
    Send {
        target: Target,
        segments: Vec<Segment>,
    },
    Recall {
        message_id: MessageId,
    },
}

impl OutboundMessage {
    pub fn text(target: Target, text: impl Into<String>) -> Self {
        OutboundMessage::Send {
            target,
            segments: vec![Segment::text(text)],
        }
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Message>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, message: Message) -> anyhow::Result<()> {
        self.inbound.send(message)?;
        Ok(())
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle the core uses to talk back to the transport.
#[derive(Clone)]
pub struct Outbox {
    sender: broadcast::Sender<OutboundMessage>,
}

impl Outbox {
    pub fn new(sender: broadcast::Sender<OutboundMessage>) -> Self {
        Self { sender }
    }

    pub fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.sender.send(message) {
            tracing::warn!("Outbound message dropped: {}", e);
        }
    }

    /// One-line text notice in reply to `message`.
    pub fn notice(&self, message: &Message, text: impl Into<String>) {
        self.send(OutboundMessage::text(message.reply_target(), text));
    }

    pub fn reply(&self, message: &Message, segments: Vec<Segment>) {
        self.send(OutboundMessage::Send {
            target: message.reply_target(),
            segments,
        });
    }

    pub fn recall(&self, message_id: MessageId) {
        self.send(OutboundMessage::Recall { message_id });
    }
}
