//! Wire format: endpoint paths, stream frames, and the `text/event-stream` decoder.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::types::{ClientSession, Error};

/// Reserved channel carrying server heartbeats. Never dispatched to handlers.
pub const HEARTBEAT_CHANNEL: &str = "$$transmit/ping";

pub(crate) const EVENTS_PATH: &str = "/__transmit/events";
pub(crate) const SUBSCRIBE_PATH: &str = "/__transmit/subscribe";
pub(crate) const UNSUBSCRIBE_PATH: &str = "/__transmit/unsubscribe";

/// A message published on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Heartbeat,
    Message(Frame),
}

pub(crate) fn decode_frame(data: &str) -> Result<Inbound, serde_json::Error> {
    let frame: Frame = serde_json::from_str(data)?;
    if frame.channel == HEARTBEAT_CHANNEL {
        return Ok(Inbound::Heartbeat);
    }
    Ok(Inbound::Message(frame))
}

/// Body of subscribe and unsubscribe requests.
#[derive(Debug, Serialize)]
pub(crate) struct ChannelRequest<'a> {
    pub uid: &'a str,
    pub channel: &'a str,
}

pub(crate) fn endpoint(base_url: &str, path: &str) -> Result<Url, Error> {
    Ok(Url::parse(&format!("{base_url}{path}"))?)
}

pub(crate) fn events_url(base_url: &str, session: &ClientSession) -> Result<Url, Error> {
    let mut url = endpoint(base_url, EVENTS_PATH)?;
    url.query_pairs_mut().append_pair("uid", session.uid());
    Ok(url)
}

/// Longest event-stream line kept; longer lines are dropped.
pub(crate) const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental decoder for `text/event-stream` bodies.
///
/// Only `data` fields are kept. Multiple `data` lines of one event are joined
/// with `\n`; the event is emitted on the blank line that ends it.
#[derive(Debug)]
pub(crate) struct SseDecoder {
    buffer: BytesMut,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    /// The rest of an oversized line is being skipped.
    discarding: bool,
    max_line: usize,
    data: Vec<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            discarding: false,
            max_line,
            data: Vec::new(),
        }
    }

    /// Feed a chunk and return the data of every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            let Some(offset) = self
                .buffer
                .get(self.scanned..)
                .and_then(|rest| rest.iter().position(|&b| b == b'\n'))
            else {
                self.scanned = self.buffer.len();
                break;
            };
            let newline_pos = self.scanned + offset;
            self.scanned = 0;
            let mut line = self.buffer.split_to(newline_pos + 1);
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if newline_pos > self.max_line {
                tracing::warn!(len = newline_pos, "dropping oversized event-stream line");
                continue;
            }
            line.truncate(newline_pos);
            if line.last() == Some(&b'\r') {
                line.truncate(newline_pos.saturating_sub(1));
            }
            let Ok(text) = std::str::from_utf8(&line) else {
                tracing::warn!("skipping event-stream line with invalid UTF-8");
                continue;
            };
            if let Some(event) = self.process_line(text) {
                events.push(event);
            }
        }
        if self.buffer.len() > self.max_line {
            tracing::warn!(len = self.buffer.len(), "dropping oversized event-stream line");
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let event = self.data.join("\n");
            self.data.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
        None
    }
}
