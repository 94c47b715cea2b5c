//! Line protocol spoken between daemons, clients and forked helpers.
//!
//! Every record is one newline-terminated line of whitespace-separated tokens. Tokens that
//! contain whitespace are wrapped in double quotes; `\"` and `\\` escape inside quotes.

use crate::error::ParseError;
use crate::value::DeltaOp;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MAX_RECORD_SIZE: usize = 64 * 1024;

pub const PROTO_VALUE: &str = "V";
pub const PROTO_SET_VALUE: &str = "X";
pub const PROTO_METAINFO: &str = "METAINFO";
pub const PROTO_SELMETAINFO: &str = "SELMETAINFO";
pub const PROTO_STATUS: &str = "S";
pub const PROTO_BOP_STATE: &str = "B";
pub const PROTO_MESSAGE: &str = "MESSAGE";
pub const PROTO_TECHNICAL: &str = "T";

pub const COMMAND_INFO: &str = "info";
pub const KEEPALIVE_PING: &str = "ready";
pub const KEEPALIVE_PONG: &str = "OK";

// Reply codes carried by completion records.
pub const REPLY_OK: i32 = 0;
pub const REPLY_QUEUED: i32 = 1;
pub const REPLY_E_HW: i32 = -1;
pub const REPLY_E_COMMAND: i32 = -2;
pub const REPLY_E_PARAMSVAL: i32 = -3;
pub const REPLY_E_SYSTEM: i32 = -4;
pub const REPLY_REQUEUE: i32 = -5;

/// One parsed protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    /// `V <name> <value...>`: the peer pushes the current text of one of its values.
    Value { name: String, text: String },
    /// `X <name> <op> <value...>`: the peer asks us to change one of our values.
    SetValue {
        name: String,
        op: DeltaOp,
        text: String,
    },
    MetaInfo {
        type_code: u32,
        name: String,
        description: String,
    },
    SelMetaInfo { name: String, symbol: String },
    Status(u32),
    BopState(u32),
    Message(Message),
    Technical(String),
    Reply { code: i32, reason: String },
    Command { opcode: String, params: String },
}

impl Record {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let mut params = Params::new(line);
        if params.is_empty() {
            return Err(ParseError::Empty);
        }
        let opcode = params.next_string()?;

        if is_reply_code(&opcode) {
            let code = opcode
                .parse::<i32>()
                .map_err(|_| ParseError::InvalidInteger(opcode.clone()))?;
            return Ok(Record::Reply {
                code,
                reason: params.next_text()?,
            });
        }

        let record = match opcode.as_str() {
            PROTO_VALUE => {
                // An empty array pushes no tokens at all.
                let name = params.next_string()?;
                let text = params.remainder();
                Record::Value {
                    name,
                    text: text.to_string(),
                }
            }
            PROTO_SET_VALUE => {
                let name = params.next_string()?;
                let op = DeltaOp::parse(&params.next_string()?)?;
                let text = params.remainder();
                if text.is_empty() {
                    return Err(ParseError::MissingParameter);
                }
                Record::SetValue {
                    name,
                    op,
                    text: text.to_string(),
                }
            }
            PROTO_METAINFO => {
                let type_code = params.next_unsigned()?;
                let name = params.next_string()?;
                let description = params.next_string()?;
                params.end()?;
                Record::MetaInfo {
                    type_code,
                    name,
                    description,
                }
            }
            PROTO_SELMETAINFO => {
                let name = params.next_string()?;
                let symbol = params.next_string()?;
                params.end()?;
                Record::SelMetaInfo { name, symbol }
            }
            PROTO_STATUS => {
                let state = params.next_unsigned()?;
                params.end()?;
                Record::Status(state)
            }
            PROTO_BOP_STATE => {
                let state = params.next_unsigned()?;
                params.end()?;
                Record::BopState(state)
            }
            PROTO_MESSAGE => Record::Message(Message::parse(&mut params)?),
            PROTO_TECHNICAL => Record::Technical(params.remainder().to_string()),
            _ => Record::Command {
                opcode,
                params: params.remainder().to_string(),
            },
        };
        Ok(record)
    }

    /// Render without the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Record::Value { name, text } => {
                format!("{PROTO_VALUE} {} {text}", quote_if_needed(name))
            }
            Record::SetValue { name, op, text } => {
                format!("{PROTO_SET_VALUE} {} {op} {text}", quote_if_needed(name))
            }
            Record::MetaInfo {
                type_code,
                name,
                description,
            } => format!(
                "{PROTO_METAINFO} {type_code} {} {}",
                quote(name),
                quote(description)
            ),
            Record::SelMetaInfo { name, symbol } => {
                format!("{PROTO_SELMETAINFO} {} {}", quote(name), quote(symbol))
            }
            Record::Status(state) => format!("{PROTO_STATUS} {state}"),
            Record::BopState(state) => format!("{PROTO_BOP_STATE} {state}"),
            Record::Message(message) => message.to_line(),
            Record::Technical(text) => format!("{PROTO_TECHNICAL} {text}"),
            Record::Reply { code, reason } => reply_line(*code, reason),
            Record::Command { opcode, params } if params.is_empty() => opcode.clone(),
            Record::Command { opcode, params } => format!("{opcode} {params}"),
        }
    }
}

pub fn reply_line(code: i32, reason: &str) -> String {
    format!("{code:+04} {}", quote(reason))
}

fn is_reply_code(token: &str) -> bool {
    let mut bytes = token.bytes();
    matches!(bytes.next(), Some(b'+' | b'-'))
        && token.len() > 1
        && bytes.all(|b| b.is_ascii_digit())
}

/// Cursor over the parameters of a record.
#[derive(Debug, Clone)]
pub struct Params<'a> {
    rest: &'a str,
}

impl<'a> Params<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { rest: text }
    }

    pub fn is_empty(&self) -> bool {
        self.rest.trim_start().is_empty()
    }

    /// Next token, unquoting it when it starts with `"`.
    pub fn next_string(&mut self) -> Result<String, ParseError> {
        let text = self.rest.trim_start();
        if text.is_empty() {
            return Err(ParseError::MissingParameter);
        }

        if let Some(quoted) = text.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.char_indices();
            while let Some((index, c)) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some((_, 'n')) => out.push('\n'),
                        Some((_, 'r')) => out.push('\r'),
                        Some((_, '0')) => out.push('\0'),
                        Some((_, escaped)) => out.push(escaped),
                        None => return Err(ParseError::UnterminatedQuote),
                    },
                    '"' => {
                        self.rest = &quoted[index + 1..];
                        return Ok(out);
                    }
                    _ => out.push(c),
                }
            }
            return Err(ParseError::UnterminatedQuote);
        }

        let end = text.find(char::is_whitespace).unwrap_or(text.len());
        let (token, rest) = text.split_at(end);
        self.rest = rest;
        Ok(token.to_string())
    }

    pub fn next_integer(&mut self) -> Result<i32, ParseError> {
        let token = self.next_string()?;
        token
            .parse()
            .map_err(|_| ParseError::InvalidInteger(token))
    }

    pub fn next_long(&mut self) -> Result<i64, ParseError> {
        let token = self.next_string()?;
        token
            .parse()
            .map_err(|_| ParseError::InvalidInteger(token))
    }

    pub fn next_unsigned(&mut self) -> Result<u32, ParseError> {
        let token = self.next_string()?;
        token
            .parse()
            .map_err(|_| ParseError::InvalidInteger(token))
    }

    pub fn next_double(&mut self) -> Result<f64, ParseError> {
        parse_double(&self.next_string()?)
    }

    /// Free text: a single quoted token, or everything left on the line.
    pub fn next_text(&mut self) -> Result<String, ParseError> {
        if self.rest.trim_start().starts_with('"') {
            let text = self.next_string()?;
            self.end()?;
            Ok(text)
        } else {
            Ok(self.remainder().to_string())
        }
    }

    /// Everything left on the line, trimmed.
    pub fn remainder(&mut self) -> &'a str {
        let rest = self.rest.trim();
        self.rest = "";
        rest
    }

    /// Everything left on the line after one separator, with its own spacing intact.
    pub fn tail(&mut self) -> &'a str {
        let rest = self.rest;
        self.rest = "";
        rest.strip_prefix(&[' ', '\t'][..]).unwrap_or(rest)
    }

    pub fn end(&self) -> Result<(), ParseError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ParseError::TrailingParameter(self.rest.trim().to_string()))
        }
    }
}

pub fn parse_double(token: &str) -> Result<f64, ParseError> {
    if token.eq_ignore_ascii_case("nan") {
        return Ok(f64::NAN);
    }
    token
        .parse()
        .map_err(|_| ParseError::InvalidNumber(token.to_string()))
}

/// Fixed-precision rendering shared by every floating kind.
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.20e}")
    }
}

pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Quote tokens that would otherwise split, vanish or read as a reply code.
pub fn quote_if_needed(text: &str) -> String {
    let ambiguous = text.is_empty()
        || text.starts_with('+')
        || text.starts_with('-')
        || text
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '"' || c == '\\');
    if ambiguous {
        quote(text)
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Error,
    Warning,
    Info,
    Debug,
}

impl MessageType {
    pub fn bits(self) -> u32 {
        match self {
            MessageType::Error => 0x01,
            MessageType::Warning => 0x02,
            MessageType::Info => 0x04,
            MessageType::Debug => 0x08,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        if bits & 0x01 != 0 {
            MessageType::Error
        } else if bits & 0x02 != 0 {
            MessageType::Warning
        } else if bits & 0x08 != 0 {
            MessageType::Debug
        } else {
            MessageType::Info
        }
    }
}

/// Log line propagated between daemons.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub sec: i64,
    pub usec: u32,
    pub origin: String,
    pub kind: MessageType,
    pub text: String,
}

impl Message {
    pub fn new(origin: &str, kind: MessageType, text: &str) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: i64::try_from(now.as_secs()).unwrap_or(i64::MAX),
            usec: now.subsec_micros(),
            origin: origin.to_string(),
            kind,
            text: text.to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{PROTO_MESSAGE} {} {} {} {} {}",
            self.sec,
            self.usec,
            quote_if_needed(&self.origin),
            self.kind.bits(),
            escape_text(&self.text)
        )
    }

    fn parse(params: &mut Params<'_>) -> Result<Self, ParseError> {
        let sec = params.next_long()?;
        let usec = params.next_unsigned()?;
        let origin = params.next_string()?;
        let kind = MessageType::from_bits(params.next_unsigned()?);
        Ok(Self {
            sec,
            usec,
            origin,
            kind,
            text: unescape_text(params.tail()),
        })
    }
}

fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\0' => out.push_str("\\0"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug)]
pub struct LineBuffer {
    data: Vec<u8>,
    limit: usize,
    discarding: bool,
}

impl LineBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            discarding: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Next complete line without its `\n` or `\r\n` terminator.
    ///
    /// A line longer than the limit is reported once and skipped up to its terminator.
    pub fn next_line(&mut self) -> Option<Result<String, ParseError>> {
        loop {
            let Some(pos) = self.data.iter().position(|&b| b == b'\n') else {
                if self.data.len() > self.limit {
                    self.data.clear();
                    if !self.discarding {
                        self.discarding = true;
                        return Some(Err(ParseError::TooLong(self.limit)));
                    }
                }
                return None;
            };

            let mut line: Vec<u8> = self.data.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.len() > self.limit {
                return Some(Err(ParseError::TooLong(self.limit)));
            }
            return Some(String::from_utf8(line).map_err(|_| ParseError::InvalidUtf8));
        }
    }
}
