use crate::connection::ConnId;
use std::time::Duration;
use thiserror::Error;

/// A malformed record or value token. The record is dropped; the connection survives.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("empty record")]
    Empty,
    #[error("missing parameter")]
    MissingParameter,
    #[error("unexpected trailing parameter '{0}'")]
    TrailingParameter(String),
    #[error("unterminated quoted string")]
    UnterminatedQuote,
    #[error("invalid integer '{0}'")]
    InvalidInteger(String),
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
    #[error("invalid boolean '{0}'")]
    InvalidBool(String),
    #[error("invalid coordinate '{0}'")]
    InvalidCoordinate(String),
    #[error("unknown selection entry '{0}'")]
    UnknownSymbol(String),
    #[error("unknown value type {0:#x}")]
    UnknownType(u32),
    #[error("unknown operator '{0}'")]
    InvalidOperator(String),
    #[error("{value} outside [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("record longer than {0} bytes")]
    TooLong(usize),
    #[error("record is not valid UTF-8")]
    InvalidUtf8,
}

/// A delta or assignment the target value cannot accept.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("operator '{op}' is not supported by {kind} values")]
    Unsupported { op: char, kind: &'static str },
    #[error("cannot combine {target} with {operand}")]
    Incompatible {
        target: &'static str,
        operand: &'static str,
    },
    #[error("selection has no entries")]
    EmptySelection,
    #[error("result {0} is out of range")]
    OutOfRange(f64),
    #[error("index {index} is past the end of an array of {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("value '{0}' is not writable")]
    NotWritable(String),
    #[error("unknown value '{0}'")]
    UnknownValue(String),
    #[error("value '{0}' already exists")]
    Duplicate(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A structurally invalid record sequence. Closes the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("reply received with no command outstanding")]
    UnexpectedReply,
    #[error("{0} consecutive malformed records")]
    TooManyParseErrors(u32),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Op(#[from] OpError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("cannot execute {path}: {reason}")]
    Spawn { path: String, reason: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),
    #[error("no connection named '{0}'")]
    UnknownPeer(String),
    #[error("command queue of connection {0} is full")]
    QueueFull(ConnId),
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnId),
    #[error("connection {0} has no way to send commands")]
    NoCommandChannel(ConnId),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

pub type Result<T> = std::result::Result<T, Error>;
