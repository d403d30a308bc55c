//! Command recognition over segmented chat messages
//!
//! A message is a command when its first text segment (after at most
//! [`MAX_PREFIX_SEGMENTS`] reply/mention segments) starts with `/`. The text
//! after the name is shell-split into arguments; the unparsed remainder is
//! recovered byte-for-byte from the raw CQ rendering for raw-mode commands.

use hurobot_ipc::{Message, Segment};
use serde::Serialize;
use tracing::debug;

pub const COMMAND_PREFIX: char = '/';
pub const MAX_PREFIX_SEGMENTS: usize = 2;

const HELP_FLAGS: [&str; 3] = ["-h", "-?", "--help"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedInvocation {
    pub name: String,
    /// `[name, words.., later segments..]`, or `None` on unbalanced quoting.
    pub args: Option<Vec<Segment>>,
    pub raw_tail: String,
    pub skip: usize,
    /// The skipped reply/mention segments, in message order.
    pub prefix: Vec<Segment>,
}

impl ParsedInvocation {
    /// `[name, raw_tail]`, with the tail omitted when empty.
    pub fn raw_args(&self) -> Vec<Segment> {
        let mut args = vec![Segment::text(&self.name)];
        if !self.raw_tail.is_empty() {
            args.push(Segment::text(&self.raw_tail));
        }
        args
    }

    pub fn effective_args(&self, need_raw_message: bool) -> Option<Vec<Segment>> {
        if need_raw_message {
            Some(self.raw_args())
        } else {
            self.args.clone()
        }
    }
}

/// True when the first argument after the command name is a help flag.
pub fn is_help_request(args: &[Segment]) -> bool {
    args.get(1)
        .and_then(Segment::as_text)
        .is_some_and(|arg| HELP_FLAGS.contains(&arg))
}

/// Splits `/name rest` into the name and whatever follows the whitespace
/// that ends it. Leading spaces are tolerated.
fn split_name(text: &str) -> Option<(&str, Option<&str>)> {
    let body = text.trim_start_matches(' ').strip_prefix(COMMAND_PREFIX)?;
    match body.char_indices().find(|(_, c)| c.is_whitespace()) {
        Some((idx, ws)) => Some((&body[..idx], Some(&body[idx + ws.len_utf8()..]))),
        None => Some((body, None)),
    }
}

pub fn tokenize(message: &Message) -> Option<ParsedInvocation> {
    let mut skip = 0;
    let content = loop {
        match message.segments.get(skip)? {
            Segment::Text(text) => break text.as_str(),
            segment if segment.is_prefix() && skip < MAX_PREFIX_SEGMENTS => skip += 1,
            _ => return None,
        }
    };

    let (name, rest) = split_name(content)?;
    if name.is_empty() {
        return None;
    }

    let raw_tail = match message.span(skip) {
        Some(span) => raw_tail_from_span(message, span.start, span.end),
        None => raw_tail_by_scan(&message.raw, skip),
    }
    .unwrap_or_else(|| {
        debug!("Could not locate '/{}' in raw message, raw tail left empty", name);
        String::new()
    });

    let args = shlex::split(rest.unwrap_or("")).map(|words| {
        let later = &message.segments[skip + 1..];
        let mut args = Vec::with_capacity(1 + words.len() + later.len());
        args.push(Segment::text(name));
        args.extend(words.into_iter().map(Segment::Text));
        args.extend(later.iter().cloned());
        args
    });

    Some(ParsedInvocation {
        name: name.to_string(),
        args,
        raw_tail,
        skip,
        prefix: message.segments[..skip].to_vec(),
    })
}

fn raw_tail_from_span(message: &Message, start: usize, end: usize) -> Option<String> {
    let (_, rest) = split_name(message.raw.get(start..end)?)?;
    let tail_start = match rest {
        Some(rest) => end - rest.len(),
        None => end,
    };
    message.raw.get(tail_start..).map(str::to_string)
}

/// Fallback for messages without spans: skip `skip` closing brackets, then
/// take everything after the first command prefix and the name behind it.
fn raw_tail_by_scan(raw: &str, skip: usize) -> Option<String> {
    let mut pos = 0;
    for _ in 0..skip {
        pos += raw[pos..].find(']')? + 1;
    }
    pos += raw[pos..].find(COMMAND_PREFIX)?;
    match split_name(&raw[pos..])? {
        (_, Some(rest)) => Some(rest.to_string()),
        (_, None) => Some(String::new()),
    }
}
