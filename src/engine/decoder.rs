//! Decodes a backend's raw answer into ordered reply segments.
//!
//! Answers embed non-text content in `<text>`, `<voice>` and `<emoji>`
//! delimiter pairs. Everything outside a recognized pair is literal text,
//! and a malformed or unterminated marker degrades to literal text instead
//! of erroring.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplySegment {
    /// Literal text to send as-is.
    Text(String),
    /// Remote audio URL to fetch, transcode and deliver as a voice message.
    Voice(String),
    /// Sticker identifier to resolve through the configured sticker table.
    Sticker(String),
}

const MARKERS: [(&str, &str, SegmentKind); 3] = [
    ("<text>", "</text>", SegmentKind::Text),
    ("<voice>", "</voice>", SegmentKind::Voice),
    ("<emoji>", "</emoji>", SegmentKind::Sticker),
];

#[derive(Clone, Copy)]
enum SegmentKind {
    Text,
    Voice,
    Sticker,
}

impl SegmentKind {
    fn segment(self, payload: &str) -> ReplySegment {
        match self {
            Self::Text => ReplySegment::Text(payload.to_string()),
            Self::Voice => ReplySegment::Voice(payload.to_string()),
            Self::Sticker => ReplySegment::Sticker(payload.to_string()),
        }
    }
}

/// Single left-to-right scan; segments come out in answer order.
pub fn decode(raw_answer: &str) -> Vec<ReplySegment> {
    let mut segments = Vec::new();
    let mut rest = raw_answer;

    while !rest.trim().is_empty() {
        let next_marker = MARKERS
            .iter()
            .filter_map(|(open, close, kind)| {
                rest.find(open).map(|at| (at, *open, *close, *kind))
            })
            .min_by_key(|(at, ..)| *at);

        let Some((at, open, close, kind)) = next_marker else {
            push_text(&mut segments, rest);
            break;
        };

        push_text(&mut segments, &rest[..at]);
        let body = &rest[at + open.len()..];
        match body.find(close) {
            Some(end) => {
                let payload = body[..end].trim();
                if !payload.is_empty() {
                    segments.push(kind.segment(payload));
                }
                rest = &body[end + close.len()..];
            }
            None => {
                // Unterminated marker: keep the remainder as literal text.
                push_text(&mut segments, rest);
                break;
            }
        }
    }

    segments
}

fn push_text(segments: &mut Vec<ReplySegment>, chunk: &str) {
    let trimmed = chunk.trim();
    if !trimmed.is_empty() {
        segments.push(ReplySegment::Text(trimmed.to_string()));
    }
}
