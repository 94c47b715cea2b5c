//! Per-connection FIFO of outbound commands.
//!
//! At most one command is in flight. Its completion (the peer's reply, or a synthesized
//! failure when the link drops) is delivered before the next command is released.

use crate::connection::ConnId;
use crate::error::{Error, Result};
use core::fmt;
use heapless::Deque;
use serde::{Deserialize, Serialize};

pub const MAX_QUEUED_COMMANDS: usize = 64;

/// Invoked exactly once with the command's outcome.
pub type Continuation = Box<dyn FnOnce(&Completion)>;

pub struct Command {
    opcode: String,
    params: Vec<String>,
    origin: Option<String>,
    continuation: Option<Continuation>,
}

impl Command {
    pub fn new(opcode: impl Into<String>) -> Self {
        Self {
            opcode: opcode.into(),
            params: Vec::new(),
            origin: None,
            continuation: None,
        }
    }

    /// Split a typed command line into opcode and parameters.
    pub fn from_line(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let mut command = Self::new(tokens.next()?);
        command.params = tokens.map(str::to_string).collect();
        Some(command)
    }

    #[must_use]
    pub fn param(mut self, param: impl ToString) -> Self {
        self.params.push(param.to_string());
        self
    }

    /// Name of the connection or subsystem the command was issued for.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn on_complete(mut self, continuation: impl FnOnce(&Completion) + 'static) -> Self {
        self.continuation = Some(Box::new(continuation));
        self
    }

    pub fn opcode(&self) -> &str {
        &self.opcode
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Wire form without the trailing newline.
    pub fn to_line(&self) -> String {
        let mut line = self.opcode.clone();
        for param in &self.params {
            line.push(' ');
            line.push_str(&quote_param(param));
        }
        line
    }
}

// Parameters never lead a record, so only separators need quoting.
fn quote_param(param: &str) -> String {
    if param.is_empty() || param.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        crate::protocol::quote(param)
    } else {
        param.to_string()
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("opcode", &self.opcode)
            .field("params", &self.params)
            .field("origin", &self.origin)
            .field("continuation", &self.continuation.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandHandle {
    pub connection: ConnId,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Failed(String),
}

impl CommandStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandStatus::Ok)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub handle: CommandHandle,
    pub line: String,
    pub origin: Option<String>,
    pub status: CommandStatus,
    /// Reply code from the peer, or the system-error code for synthesized failures.
    pub code: i32,
}

#[derive(Debug)]
pub struct Queued {
    pub handle: CommandHandle,
    pub command: Command,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_queued: u64,
    pub total_ok: u64,
    pub total_failed: u64,
    pub total_requeued: u64,
}

#[derive(Debug)]
pub struct CommandQueue {
    connection: ConnId,
    next_sequence: u64,
    waiting: Deque<Queued, MAX_QUEUED_COMMANDS>,
    in_flight: Option<Queued>,
    stats: QueueStats,
}

impl CommandQueue {
    pub fn new(connection: ConnId) -> Self {
        Self {
            connection,
            next_sequence: 0,
            waiting: Deque::new(),
            in_flight: None,
            stats: QueueStats::default(),
        }
    }

    pub fn enqueue(&mut self, command: Command) -> Result<CommandHandle> {
        let queued = self.wrap(command);
        let handle = queued.handle;
        self.waiting
            .push_back(queued)
            .map_err(|_| Error::QueueFull(self.connection))?;
        self.stats.total_queued += 1;
        Ok(handle)
    }

    /// Queue ahead of every waiting command. The in-flight command is not disturbed.
    pub fn enqueue_front(&mut self, command: Command) -> Result<CommandHandle> {
        let queued = self.wrap(command);
        let handle = queued.handle;
        self.waiting
            .push_front(queued)
            .map_err(|_| Error::QueueFull(self.connection))?;
        self.stats.total_queued += 1;
        Ok(handle)
    }

    fn wrap(&mut self, command: Command) -> Queued {
        self.next_sequence += 1;
        Queued {
            handle: CommandHandle {
                connection: self.connection,
                sequence: self.next_sequence,
            },
            command,
        }
    }

    /// Promote the head command when nothing is in flight and return it for writing.
    pub fn start_next(&mut self) -> Option<&Queued> {
        if self.in_flight.is_some() {
            return None;
        }
        self.in_flight = self.waiting.pop_front();
        self.in_flight.as_ref()
    }

    pub fn in_flight(&self) -> Option<&Queued> {
        self.in_flight.as_ref()
    }

    /// Resolve the in-flight command and run its continuation.
    pub fn complete(&mut self, status: CommandStatus, code: i32) -> Option<Completion> {
        let queued = self.in_flight.take()?;
        if status.is_ok() {
            self.stats.total_ok += 1;
        } else {
            self.stats.total_failed += 1;
        }
        Some(finish(queued, status, code))
    }

    /// Put the in-flight command back at the head of the queue.
    pub fn requeue_in_flight(&mut self) -> bool {
        let Some(queued) = self.in_flight.take() else {
            return false;
        };
        match self.waiting.push_front(queued) {
            Ok(()) => {
                self.stats.total_requeued += 1;
                true
            }
            // A full queue keeps the command in flight.
            Err(queued) => {
                self.in_flight = Some(queued);
                false
            }
        }
    }

    /// Fail the in-flight command and then every waiting one, in FIFO order.
    pub fn fail_all(&mut self, reason: &str, code: i32) -> Vec<Completion> {
        let mut completions = Vec::with_capacity(self.len());
        let pending = self.in_flight.take().into_iter();
        let waiting = core::iter::from_fn(|| self.waiting.pop_front());
        for queued in pending.chain(waiting).collect::<Vec<_>>() {
            self.stats.total_failed += 1;
            completions.push(finish(
                queued,
                CommandStatus::Failed(reason.to_string()),
                code,
            ));
        }
        completions
    }

    /// Waiting plus in-flight commands.
    pub fn len(&self) -> usize {
        self.waiting.len() + usize::from(self.in_flight.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_waiting(&self) -> bool {
        !self.waiting.is_empty()
    }

    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }
}

fn finish(queued: Queued, status: CommandStatus, code: i32) -> Completion {
    let Queued { handle, command } = queued;
    let completion = Completion {
        handle,
        line: command.to_line(),
        origin: command.origin.clone(),
        status,
        code,
    };
    if let Some(continuation) = command.continuation {
        continuation(&completion);
    }
    completion
}
