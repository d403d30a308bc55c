//! CQ-code rendering and parsing.
//!
//! The transport flattens a message into one string where every non-text
//! segment becomes a bracketed tag such as `[CQ:at,qq=123]`. Text runs escape
//! `&`, `[` and `]`; tag parameters additionally escape `,`.

use crate::Segment;
use std::ops::Range;

const CODE_OPEN: &str = "[CQ:";
const CODE_CLOSE: char = ']';

pub fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('[', "&#91;")
        .replace(']', "&#93;")
}

pub fn escape_param(value: &str) -> String {
    escape_text(value).replace(',', "&#44;")
}

pub fn unescape(raw: &str) -> String {
    raw.replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&#44;", ",")
        .replace("&amp;", "&")
}

/// Appends the raw form of one segment to `out`.
pub fn render_segment(segment: &Segment, out: &mut String) {
    match segment {
        Segment::Text(text) => out.push_str(&escape_text(text)),
        Segment::Mention(user_id) => out.push_str(&format!("[CQ:at,qq={}]", user_id)),
        Segment::Face(id) => out.push_str(&format!("[CQ:face,id={}]", id)),
        Segment::Image { url } => out.push_str(&format!("[CQ:image,url={}]", escape_param(url))),
        Segment::Voice { file } => {
            out.push_str(&format!("[CQ:record,file={}]", escape_param(file)))
        }
        Segment::Reply(message_id) => out.push_str(&format!("[CQ:reply,id={}]", message_id)),
        Segment::File { file } => out.push_str(&format!("[CQ:file,file={}]", escape_param(file))),
        Segment::Forward { id } => out.push_str(&format!("[CQ:forward,id={}]", escape_param(id))),
        Segment::OpaqueJson(data) => {
            out.push_str(&format!("[CQ:json,data={}]", escape_param(data)))
        }
    }
}

/// Renders segments and records the byte range each one occupies.
pub fn render(segments: &[Segment]) -> (String, Vec<Range<usize>>) {
    let mut raw = String::new();
    let mut spans = Vec::with_capacity(segments.len());
    for segment in segments {
        let start = raw.len();
        render_segment(segment, &mut raw);
        spans.push(start..raw.len());
    }
    (raw, spans)
}

/// Parses a raw CQ string back into segments with their byte ranges.
///
/// An unterminated `[CQ:` is kept as literal text. Codes this crate does not
/// model, and modelled codes with unusable parameters, become `OpaqueJson`
/// carrying the unescaped code body.
pub fn parse(raw: &str) -> (Vec<Segment>, Vec<Range<usize>>) {
    let mut segments = Vec::new();
    let mut spans = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;

    while let Some(found) = raw[cursor..].find(CODE_OPEN) {
        let open = cursor + found;
        let Some(close_rel) = raw[open..].find(CODE_CLOSE) else {
            break;
        };
        let close = open + close_rel;

        if open > text_start {
            segments.push(Segment::Text(unescape(&raw[text_start..open])));
            spans.push(text_start..open);
        }

        let body = &raw[open + CODE_OPEN.len()..close];
        segments.push(parse_code(body));
        spans.push(open..close + 1);

        cursor = close + 1;
        text_start = cursor;
    }

    if text_start < raw.len() {
        segments.push(Segment::Text(unescape(&raw[text_start..])));
        spans.push(text_start..raw.len());
    }

    (segments, spans)
}

fn parse_code(body: &str) -> Segment {
    let mut parts = body.split(',');
    let kind = parts.next().unwrap_or_default();
    let params: Vec<(&str, String)> = parts
        .filter_map(|part| part.split_once('='))
        .map(|(key, value)| (key, unescape(value)))
        .collect();
    let param = |key: &str| lookup(&params, key);

    let parsed = match kind {
        "at" => param("qq")
            .and_then(|v| v.parse().ok())
            .map(Segment::Mention),
        "face" => param("id").and_then(|v| v.parse().ok()).map(Segment::Face),
        "image" => param("url").or_else(|| param("file")).map(|url| Segment::Image {
            url: url.to_string(),
        }),
        "record" => param("file")
            .or_else(|| param("path"))
            .or_else(|| param("url"))
            .map(|file| Segment::Voice {
                file: file.to_string(),
            }),
        "reply" => param("id").and_then(|v| v.parse().ok()).map(Segment::Reply),
        "file" => param("file").map(|file| Segment::File {
            file: file.to_string(),
        }),
        "forward" => param("id").map(|id| Segment::Forward { id: id.to_string() }),
        "json" => param("data").map(|data| Segment::OpaqueJson(data.to_string())),
        _ => None,
    };

    parsed.unwrap_or_else(|| Segment::OpaqueJson(unescape(body)))
}

fn lookup<'a>(params: &'a [(&str, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
}
