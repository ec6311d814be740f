//! AMI wire framing: greeting line, `Key: Value` blocks, classification

use crate::{
    buffer::AmiBuffer,
    constants::{
        BARE_BLOCK_TERMINATOR, BLOCK_TERMINATOR, GREETING_PREFIX, HEADER_EVENT, HEADER_RESPONSE,
        MAX_MESSAGE_SIZE,
    },
    error::{AmiError, AmiResult},
    headers::AmiHeaders,
};
use tracing::trace;

/// Header name given to continuation lines that carry no `Key:` prefix
/// (legacy `Response: Follows` command output).
const OUTPUT_HEADER: &str = "Output";

/// Message classes on the manager socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    /// Carries `Response:`; correlated by `ActionID`.
    Response,
    /// Carries `Event:`; list records also carry `ActionID`.
    Event,
    /// Neither; logged and discarded by the reader.
    Unknown,
}

/// One parsed block.
#[derive(Debug, Clone)]
pub struct AmiMessage {
    pub message_type: MessageType,
    pub headers: AmiHeaders,
}

impl AmiMessage {
    pub fn new(headers: AmiHeaders) -> Self {
        let message_type = if headers.contains(HEADER_RESPONSE) {
            MessageType::Response
        } else if headers.contains(HEADER_EVENT) {
            MessageType::Event
        } else {
            MessageType::Unknown
        };
        Self {
            message_type,
            headers,
        }
    }
}

/// Incremental AMI parser.
///
/// Bytes are pushed with [`add_data`](Self::add_data); complete blocks are
/// pulled with [`parse_message`](Self::parse_message).
pub struct AmiParser {
    buffer: AmiBuffer,
}

impl AmiParser {
    pub fn new() -> Self {
        Self {
            buffer: AmiBuffer::new(),
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()?;
        Ok(())
    }

    /// Take the `Asterisk Call Manager/x.y` greeting line, if complete.
    ///
    /// The greeting is the only unterminated single line on the protocol and
    /// is only valid as the first bytes of a connection.
    pub fn parse_greeting(&mut self) -> AmiResult<Option<String>> {
        let Some(line) = self
            .buffer
            .extract_until_pattern(b"\n")
        else {
            if self.buffer.len() > MAX_MESSAGE_SIZE {
                return Err(AmiError::protocol_error("Greeting line too long"));
            }
            return Ok(None);
        };
        self.buffer
            .compact();
        let line = String::from_utf8_lossy(&line)
            .trim()
            .to_string();
        if !line.starts_with(GREETING_PREFIX) {
            return Err(AmiError::protocol_error(format!(
                "Unexpected greeting: {}",
                line
            )));
        }
        Ok(Some(line))
    }

    /// Try to parse a complete block from the buffer.
    ///
    /// Empty blocks (stray blank lines) are skipped.
    pub fn parse_message(&mut self) -> AmiResult<Option<AmiMessage>> {
        loop {
            let Some((end, skip)) = self.block_end() else {
                if self.buffer.len() > MAX_MESSAGE_SIZE {
                    return Err(AmiError::protocol_error(format!(
                        "No block terminator within {} bytes, likely protocol desync",
                        MAX_MESSAGE_SIZE
                    )));
                }
                return Ok(None);
            };
            let raw = self
                .buffer
                .take(end, skip);
            self.buffer
                .compact();

            let text = String::from_utf8_lossy(&raw);
            let headers = parse_headers(&text);
            if headers.is_empty() {
                trace!("[RECV] Skipping empty block");
                continue;
            }
            return Ok(Some(AmiMessage::new(headers)));
        }
    }

    /// Bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buffer
            .len()
    }

    /// Earliest block terminator: offset and terminator length.
    fn block_end(&self) -> Option<(usize, usize)> {
        let crlf = self
            .buffer
            .find(BLOCK_TERMINATOR.as_bytes())
            .map(|p| (p, BLOCK_TERMINATOR.len()));
        let lf = self
            .buffer
            .find(BARE_BLOCK_TERMINATOR.as_bytes())
            .map(|p| (p, BARE_BLOCK_TERMINATOR.len()));
        match (crlf, lf) {
            (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
            (a, b) => a.or(b),
        }
    }
}

impl Default for AmiParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `Key: Value` lines. Lines without a colon are kept as `Output`.
pub(crate) fn parse_headers(block: &str) -> AmiHeaders {
    let mut headers = AmiHeaders::new();
    for line in block.split('\n') {
        let line = line.trim_end_matches('\r');
        if line
            .trim()
            .is_empty()
        {
            continue;
        }
        match line.find(':') {
            Some(colon_pos) if colon_pos > 0 => {
                let key = line[..colon_pos].trim();
                let value = line[colon_pos + 1..].trim();
                headers.push(key, value);
            }
            _ => headers.push(OUTPUT_HEADER, line.trim()),
        }
    }
    headers
}
