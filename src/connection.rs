//! One peer link: line framing, record dispatch, mirrors and the command queue.
//!
//! A connection never blocks. The reactor polls it for readiness and it reacts to whatever
//! bytes have arrived; everything observable to the rest of the process leaves as [`Event`]s
//! collected in an outbox the reactor drains after each pass.

use crate::command::{Command, CommandHandle, CommandQueue, CommandStatus};
use crate::device::{CommandOutcome, Device, DeviceStatus};
use crate::error::{Error, OpError, ParseError, ProtocolError, Result};
use crate::event::{CloseReason, CoreEvent, Event};
use crate::fork::{ChildExit, ForkState};
use crate::protocol::{
    reply_line, LineBuffer, Message, Record, COMMAND_INFO, KEEPALIVE_PING, KEEPALIVE_PONG,
    MAX_RECORD_SIZE, PROTO_TECHNICAL, REPLY_E_COMMAND, REPLY_E_HW, REPLY_E_PARAMSVAL,
    REPLY_E_SYSTEM, REPLY_OK, REPLY_QUEUED, REPLY_REQUEUE,
};
use crate::value::{DeltaOp, Mirror, Value, ValueSet};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

const READ_CHUNK: usize = 4096;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_PARSE_ERRORS: u32 = 10;
const CONNECTION_LOST: &str = "connection lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Client,
    Device,
    Centrald,
    Fork,
    Serial,
}

impl PeerKind {
    /// Peers that receive our dirty values.
    pub fn subscribes(self) -> bool {
        matches!(self, PeerKind::Client | PeerKind::Centrald)
    }

    pub fn default_timeout(self) -> Option<Duration> {
        match self {
            PeerKind::Fork | PeerKind::Serial => None,
            _ => Some(DEFAULT_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Established,
    Draining,
    Closed,
}

/// Any byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> Transport for T {}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>>>>;

enum Link {
    /// No transport; output accumulates until taken.
    Detached,
    Connecting(ConnectFuture),
    Stream(Box<dyn Transport>),
}

/// The endpoint's own state, lent to a connection while it handles inbound records.
pub struct Local<'a> {
    pub values: &'a mut ValueSet,
    pub device: Option<&'a mut (dyn Device + 'static)>,
}

pub struct Connection {
    id: ConnId,
    name: String,
    kind: PeerKind,
    state: ConnState,
    link: Link,
    input: LineBuffer,
    output: Vec<u8>,
    queue: CommandQueue,
    mirrors: BTreeMap<String, Mirror>,
    status: DeviceStatus,
    bop_state: u32,
    timeout: Option<Duration>,
    last_activity: Instant,
    last_keepalive: Option<Instant>,
    parse_errors: u32,
    max_parse_errors: u32,
    announced: HashSet<String>,
    events: Vec<Event>,
    read_closed: bool,
    fork: Option<Box<ForkState>>,
}

impl Connection {
    fn with_link(id: ConnId, kind: PeerKind, name: &str, state: ConnState, link: Link) -> Self {
        Self {
            id,
            name: name.to_string(),
            kind,
            state,
            link,
            input: LineBuffer::new(MAX_RECORD_SIZE),
            output: Vec::new(),
            queue: CommandQueue::new(id),
            mirrors: BTreeMap::new(),
            status: DeviceStatus::default(),
            bop_state: 0,
            timeout: kind.default_timeout(),
            last_activity: Instant::now(),
            last_keepalive: None,
            parse_errors: 0,
            max_parse_errors: DEFAULT_MAX_PARSE_ERRORS,
            announced: HashSet::new(),
            events: Vec::new(),
            read_closed: false,
            fork: None,
        }
    }

    /// An established connection with no transport. Inbound bytes go through
    /// [`receive`](Self::receive) and outbound bytes are collected with
    /// [`take_output`](Self::take_output).
    pub fn in_memory(id: ConnId, kind: PeerKind, name: &str) -> Self {
        Self::with_link(id, kind, name, ConnState::Established, Link::Detached)
    }

    pub fn from_stream(
        id: ConnId,
        kind: PeerKind,
        name: &str,
        stream: impl Transport + 'static,
    ) -> Self {
        Self::with_link(
            id,
            kind,
            name,
            ConnState::Established,
            Link::Stream(Box::new(stream)),
        )
    }

    /// Start a non-blocking TCP connect. Commands queued meanwhile wait for the handshake.
    pub fn connecting(id: ConnId, kind: PeerKind, name: &str, address: &str) -> Self {
        let address = address.to_string();
        let connect: ConnectFuture = Box::pin(async move { TcpStream::connect(address).await });
        Self::with_link(id, kind, name, ConnState::Connecting, Link::Connecting(connect))
    }

    pub(crate) fn with_fork(mut self, fork: ForkState) -> Self {
        self.fork = Some(Box::new(fork));
        self
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PeerKind {
        self.kind
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Last status word announced by the peer.
    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    pub fn bop_state(&self) -> u32 {
        self.bop_state
    }

    pub fn mirrors(&self) -> &BTreeMap<String, Mirror> {
        &self.mirrors
    }

    pub fn mirror(&self, name: &str) -> Option<&Mirror> {
        self.mirrors.get(name)
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// `None` disables both keepalives and the silence timeout.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_max_parse_errors(&mut self, max: u32) {
        self.max_parse_errors = max;
    }

    pub fn set_record_limit(&mut self, limit: usize) {
        self.input = LineBuffer::new(limit);
    }

    pub fn fork(&self) -> Option<&ForkState> {
        self.fork.as_deref()
    }

    pub fn fork_mut(&mut self) -> Option<&mut ForkState> {
        self.fork.as_deref_mut()
    }

    pub fn wants_read(&self) -> bool {
        self.state == ConnState::Established && !self.read_closed
    }

    pub fn wants_write(&self) -> bool {
        !self.output.is_empty()
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn queue_command(&mut self, command: Command) -> Result<CommandHandle> {
        self.check_accepts_commands()?;
        let handle = self.queue.enqueue(command)?;
        self.pump_commands();
        Ok(handle)
    }

    /// Queue ahead of every command still waiting.
    pub fn queue_urgent(&mut self, command: Command) -> Result<CommandHandle> {
        self.check_accepts_commands()?;
        let handle = self.queue.enqueue_front(command)?;
        self.pump_commands();
        Ok(handle)
    }

    fn check_accepts_commands(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed(self.id));
        }
        if self.fork.as_deref().is_some_and(|fork| !fork.has_stdin()) {
            return Err(Error::NoCommandChannel(self.id));
        }
        Ok(())
    }

    fn pump_commands(&mut self) {
        if self.state != ConnState::Established {
            return;
        }
        if let Some(queued) = self.queue.start_next() {
            let line = queued.command.to_line();
            trace!(conn = %self.id, peer = %self.name, "sending command {}", line);
            self.send_line(&line);
        }
    }

    pub fn send_line(&mut self, line: &str) {
        self.output.extend_from_slice(line.as_bytes());
        self.output.push(b'\n');
    }

    pub fn send_record(&mut self, record: &Record) {
        self.send_line(&record.to_line());
    }

    pub fn send_reply(&mut self, code: i32, reason: &str) {
        self.send_line(&reply_line(code, reason));
    }

    pub fn send_message(&mut self, message: &Message) {
        self.send_line(&message.to_line());
    }

    pub fn send_status(&mut self, status: DeviceStatus) {
        self.send_record(&Record::Status(status.bits()));
    }

    pub fn send_bop_state(&mut self, state: u32) {
        self.send_record(&Record::BopState(state));
    }

    /// Push one of our values, preceded by its metainfo the first time this peer sees it.
    pub fn send_value(&mut self, value: &Value) {
        if self.announced.insert(value.name().to_string()) {
            for record in value.meta_records() {
                self.send_record(&record);
            }
        }
        self.send_record(&value.value_record());
    }

    pub fn send_all(&mut self, values: &ValueSet) {
        for value in values.iter() {
            self.send_value(value);
        }
    }

    /// Publish dirty values to a subscribed peer.
    pub fn broadcast_dirty(&mut self, values: &ValueSet) {
        if !self.kind.subscribes() || !self.is_established() {
            return;
        }
        for value in values.dirty() {
            self.send_value(value);
        }
    }

    /// Ask for shutdown. Buffered output is flushed first when a transport is attached.
    pub fn close(&mut self, reason: CloseReason) {
        match self.state {
            ConnState::Closed => {}
            ConnState::Draining if reason == CloseReason::Requested => {}
            _ if reason == CloseReason::Requested
                && self.wants_write()
                && matches!(self.link, Link::Stream(_)) =>
            {
                debug!(conn = %self.id, peer = %self.name, "draining before close");
                self.state = ConnState::Draining;
            }
            _ => self.finish_close(reason),
        }
    }

    fn finish_close(&mut self, reason: CloseReason) {
        self.state = ConnState::Closed;
        self.link = Link::Detached;
        for completion in self.queue.fail_all(CONNECTION_LOST, REPLY_E_SYSTEM) {
            self.events
                .push(CoreEvent::CommandFailed { completion }.into());
        }
        info!(conn = %self.id, peer = %self.name, "connection closed: {:?}", reason);
        self.events.push(
            CoreEvent::ConnectionClosed {
                conn: self.id,
                name: self.name.clone(),
                reason,
            }
            .into(),
        );
    }

    pub(crate) fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let Link::Connecting(connect) = &mut self.link else {
            return Poll::Pending;
        };
        match connect.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(conn = %self.id, "cannot disable nagle: {}", e);
                }
                self.link = Link::Stream(Box::new(stream));
                self.state = ConnState::Established;
                self.last_activity = Instant::now();
                info!(conn = %self.id, peer = %self.name, "connection established");
                self.events.push(
                    CoreEvent::ConnectionEstablished {
                        conn: self.id,
                        name: self.name.clone(),
                    }
                    .into(),
                );
                self.pump_commands();
                Poll::Ready(())
            }
            Poll::Ready(Err(e)) => {
                warn!(conn = %self.id, peer = %self.name, "connect failed: {}", e);
                self.finish_close(CloseReason::Io(e.to_string()));
                Poll::Ready(())
            }
        }
    }

    /// Read until the transport would block. Ready means at least one byte or a state change.
    pub(crate) fn on_readable(&mut self, cx: &mut Context<'_>, local: &mut Local<'_>) -> Poll<()> {
        let mut progress = false;
        let mut buf = [0u8; READ_CHUNK];
        while self.wants_read() {
            let Link::Stream(stream) = &mut self.link else {
                break;
            };
            let mut read_buf = ReadBuf::new(&mut buf);
            match Pin::new(&mut **stream).poll_read(cx, &mut read_buf) {
                Poll::Pending => break,
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    progress = true;
                    if n == 0 {
                        self.on_eof();
                        break;
                    }
                    self.receive(&buf[..n], local);
                }
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Poll::Ready(Err(e)) => {
                    warn!(conn = %self.id, peer = %self.name, "read failed: {}", e);
                    self.finish_close(CloseReason::Io(e.to_string()));
                    progress = true;
                }
            }
        }
        if progress {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    fn on_eof(&mut self) {
        self.read_closed = true;
        match &self.fork {
            // Wait for the exit status before tearing the link down.
            Some(fork) if !fork.is_reaped() => {
                debug!(conn = %self.id, "child closed stdout");
            }
            Some(_) => self.finish_close(CloseReason::ChildEnded),
            None => self.finish_close(CloseReason::PeerClosed),
        }
    }

    /// Flush buffered output. Partial writes keep the remainder for the next pass.
    pub(crate) fn on_writable(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let mut progress = false;
        while !self.output.is_empty() {
            let Link::Stream(stream) = &mut self.link else {
                break;
            };
            match Pin::new(&mut **stream).poll_write(cx, &self.output) {
                Poll::Pending => break,
                Poll::Ready(Ok(0)) => {
                    self.finish_close(CloseReason::Io("write returned zero".to_string()));
                    return Poll::Ready(());
                }
                Poll::Ready(Ok(n)) => {
                    self.output.drain(..n);
                    progress = true;
                }
                Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Poll::Ready(Err(e)) => {
                    warn!(conn = %self.id, peer = %self.name, "write failed: {}", e);
                    self.finish_close(CloseReason::Io(e.to_string()));
                    return Poll::Ready(());
                }
            }
        }

        if self.output.is_empty() {
            if let Link::Stream(stream) = &mut self.link {
                // Buffered transports hold bytes until flushed; pending here is harmless.
                let _ = Pin::new(&mut **stream).poll_flush(cx);
            }
            if self.state == ConnState::Draining {
                self.finish_close(CloseReason::Requested);
                progress = true;
            }
        }

        if progress {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    pub(crate) fn poll_stderr(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let id = self.id;
        match self.fork.as_deref_mut() {
            Some(fork) => fork.poll_stderr(cx, id),
            None => Poll::Pending,
        }
    }

    /// Feed raw bytes from the peer and dispatch every complete record.
    pub fn receive(&mut self, bytes: &[u8], local: &mut Local<'_>) {
        self.last_activity = Instant::now();
        self.last_keepalive = None;
        self.input.push(bytes);
        while let Some(line) = self.input.next_line() {
            if self.is_closed() {
                break;
            }
            match line {
                Ok(line) => self.process_line(&line, local),
                Err(e) => self.parse_failed(&e),
            }
        }
    }

    fn process_line(&mut self, line: &str, local: &mut Local<'_>) {
        if line.trim().is_empty() {
            return;
        }
        trace!(conn = %self.id, peer = %self.name, "received {}", line);
        let outcome = Record::parse(line).and_then(|record| self.dispatch(record, local));
        match outcome {
            Ok(()) => self.parse_errors = 0,
            Err(e) => self.parse_failed(&e),
        }
    }

    fn parse_failed(&mut self, error: &ParseError) {
        self.parse_errors += 1;
        warn!(
            conn = %self.id,
            peer = %self.name,
            "dropping malformed record ({} in a row): {}",
            self.parse_errors,
            error
        );
        if self.parse_errors > self.max_parse_errors {
            self.finish_close(CloseReason::Protocol(ProtocolError::TooManyParseErrors(
                self.parse_errors,
            )));
        }
    }

    fn dispatch(&mut self, record: Record, local: &mut Local<'_>) -> std::result::Result<(), ParseError> {
        match record {
            Record::Value { name, text } => self.replicate(&name, &text)?,
            Record::MetaInfo {
                type_code,
                name,
                description,
            } => {
                let mirror = Mirror::announce(type_code, &name, &description)?;
                debug!(conn = %self.id, "peer announced {} ({:#x})", name, type_code);
                self.mirrors.insert(name, mirror);
            }
            Record::SelMetaInfo { name, symbol } => {
                let added = self
                    .mirrors
                    .get_mut(&name)
                    .is_some_and(|mirror| mirror.add_symbol(&symbol));
                if !added {
                    debug!(conn = %self.id, "symbol {} for unknown selection {}", symbol, name);
                }
            }
            Record::Status(bits) => {
                let old = self.status;
                self.status = DeviceStatus(bits);
                if old != self.status {
                    self.events.push(
                        CoreEvent::StatusChanged {
                            conn: self.id,
                            old,
                            new: self.status,
                        }
                        .into(),
                    );
                }
            }
            Record::BopState(bits) => self.bop_state = bits,
            Record::Message(message) => {
                self.events.push(
                    CoreEvent::Message {
                        conn: self.id,
                        message,
                    }
                    .into(),
                );
            }
            Record::Technical(text) => {
                if text == KEEPALIVE_PING {
                    self.send_line(&format!("{PROTO_TECHNICAL} {KEEPALIVE_PONG}"));
                }
            }
            Record::Reply { code, reason } => self.handle_reply(code, &reason),
            Record::SetValue { name, op, text } => self.handle_set(&name, op, &text, local)?,
            Record::Command { opcode, params } => self.handle_command(&opcode, &params, local)?,
        }
        Ok(())
    }

    fn replicate(&mut self, name: &str, text: &str) -> std::result::Result<(), ParseError> {
        let Some(mirror) = self.mirrors.get_mut(name) else {
            debug!(conn = %self.id, "value {} pushed before its metainfo", name);
            return Ok(());
        };
        mirror.replicate(text)?;
        mirror.clear_dirty();
        self.events.push(
            CoreEvent::ValueChanged {
                conn: self.id,
                name: name.to_string(),
            }
            .into(),
        );
        Ok(())
    }

    fn handle_reply(&mut self, code: i32, reason: &str) {
        if self.queue.in_flight().is_none() {
            warn!(conn = %self.id, peer = %self.name, "reply {} with no command outstanding", code);
            self.finish_close(CloseReason::Protocol(ProtocolError::UnexpectedReply));
            return;
        }
        match code {
            REPLY_QUEUED => return,
            // Sent again from the next idle pass.
            REPLY_REQUEUE => {
                self.queue.requeue_in_flight();
                return;
            }
            _ => {}
        }

        let status = if code >= REPLY_OK {
            CommandStatus::Ok
        } else {
            CommandStatus::Failed(reason.to_string())
        };
        if let Some(completion) = self.queue.complete(status, code) {
            let event = if completion.status.is_ok() {
                CoreEvent::CommandOk { completion }
            } else {
                debug!(conn = %self.id, "command {} failed: {}", completion.line, reason);
                CoreEvent::CommandFailed { completion }
            };
            self.events.push(event.into());
        }
        self.pump_commands();
    }

    fn handle_set(
        &mut self,
        name: &str,
        op: DeltaOp,
        text: &str,
        local: &mut Local<'_>,
    ) -> std::result::Result<(), ParseError> {
        let Some(current) = local.values.get(name) else {
            self.send_reply(REPLY_E_PARAMSVAL, &OpError::UnknownValue(name.to_string()).to_string());
            return Ok(());
        };
        if !current.is_writable() {
            self.send_reply(REPLY_E_PARAMSVAL, &OpError::NotWritable(name.to_string()).to_string());
            return Ok(());
        }

        let mut updated = current.clone();
        match updated.apply_text(op, text) {
            Ok(()) => {}
            Err(OpError::Parse(e)) => {
                self.send_reply(REPLY_E_PARAMSVAL, &e.to_string());
                return Err(e);
            }
            Err(e) => {
                self.send_reply(REPLY_E_PARAMSVAL, &e.to_string());
                return Ok(());
            }
        }
        if let Some(device) = local.device.as_deref_mut() {
            if let Err(reason) = device.set_value(current, &updated) {
                self.send_reply(REPLY_E_HW, &reason);
                return Ok(());
            }
        }

        if let Some(slot) = local.values.get_mut(name) {
            *slot = updated;
            slot.mark_dirty();
        }
        info!(conn = %self.id, peer = %self.name, "{} {} {}", name, op, text);
        self.send_reply(REPLY_OK, "OK");
        self.events.push(
            CoreEvent::ValueSet {
                conn: self.id,
                name: name.to_string(),
            }
            .into(),
        );
        Ok(())
    }

    fn handle_command(
        &mut self,
        opcode: &str,
        params: &str,
        local: &mut Local<'_>,
    ) -> std::result::Result<(), ParseError> {
        if opcode == COMMAND_INFO {
            if let Some(device) = local.device.as_deref_mut() {
                if let Err(reason) = device.info(local.values) {
                    self.send_reply(REPLY_E_HW, &reason);
                    return Ok(());
                }
            }
            self.send_all(local.values);
            self.send_reply(REPLY_OK, "OK");
            return Ok(());
        }

        // `NAME value` is shorthand for `X NAME = value`.
        if local.values.get(opcode).is_some_and(Value::is_writable) {
            return self.handle_set(opcode, DeltaOp::Set, params, local);
        }

        let outcome = match local.device.as_deref_mut() {
            Some(device) => device.command(opcode, params, local.values),
            None => CommandOutcome::Unknown,
        };
        match outcome {
            CommandOutcome::Ok => self.send_reply(REPLY_OK, "OK"),
            CommandOutcome::Failed { code, reason } => self.send_reply(code, &reason),
            CommandOutcome::Requeue => self.send_reply(REPLY_REQUEUE, "retry later"),
            CommandOutcome::Unknown => {
                debug!(conn = %self.id, "unknown command {}", opcode);
                self.send_reply(REPLY_E_COMMAND, &format!("unknown command {opcode}"));
            }
        }
        Ok(())
    }

    /// Keepalives, silence timeout, fork deadline and deferred command writes.
    pub fn idle(&mut self, now: Instant) {
        if let Some(fork) = self.fork.as_deref_mut() {
            if fork.deadline_passed(now) {
                let pid = fork.pid();
                warn!(conn = %self.id, pid, "child exceeded its deadline, killing process group");
                fork.kill_group();
                if fork.end(ChildExit::TimedOut) {
                    self.events.push(
                        CoreEvent::ChildEnded {
                            conn: self.id,
                            pid,
                            exit: ChildExit::TimedOut,
                        }
                        .into(),
                    );
                }
                self.finish_close(CloseReason::Timeout);
                return;
            }
        }

        if self.state != ConnState::Established {
            return;
        }
        self.pump_commands();

        let Some(timeout) = self.timeout else {
            return;
        };
        let silent = now.saturating_duration_since(self.last_activity);
        if silent > timeout {
            warn!(conn = %self.id, peer = %self.name, "no data for {:?}, closing", silent);
            self.finish_close(CloseReason::Timeout);
            return;
        }
        let interval = timeout / 4;
        let keepalive_due = self
            .last_keepalive
            .map_or(true, |sent| now.saturating_duration_since(sent) >= interval);
        if silent >= interval && keepalive_due {
            self.send_line(&format!("{PROTO_TECHNICAL} {KEEPALIVE_PING}"));
            self.last_keepalive = Some(now);
        }
    }

    /// The forked child was reaped. Runs before the generic close path.
    pub(crate) fn child_returned(&mut self, exit: ChildExit) {
        let Some(fork) = self.fork.as_deref_mut() else {
            return;
        };
        let pid = fork.pid();
        fork.mark_reaped();
        info!(conn = %self.id, pid, "child returned: {:?}", exit);
        if fork.end(exit) {
            self.events.push(
                CoreEvent::ChildEnded {
                    conn: self.id,
                    pid,
                    exit,
                }
                .into(),
            );
        }
        if self.read_closed || matches!(self.link, Link::Detached) {
            self.finish_close(CloseReason::ChildEnded);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("queued", &self.queue.len())
            .field("mirrors", &self.mirrors.len())
            .finish_non_exhaustive()
    }
}

/// Every connection a block owns, in creation order.
#[derive(Debug, Default)]
pub struct Connections {
    items: Vec<Connection>,
    next_id: u32,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> ConnId {
        self.next_id += 1;
        ConnId(self.next_id)
    }

    pub fn insert(&mut self, connection: Connection) -> ConnId {
        let id = connection.id();
        self.items.push(connection);
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.items.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.items.iter_mut().find(|c| c.id == id)
    }

    /// Live connection to the named peer.
    pub fn by_name(&self, name: &str) -> Option<&Connection> {
        self.items
            .iter()
            .find(|c| c.name == name && !c.is_closed())
    }

    pub fn by_name_mut(&mut self, name: &str) -> Option<&mut Connection> {
        self.items
            .iter_mut()
            .find(|c| c.name == name && !c.is_closed())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.items.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Detach closed connections whose events have been collected.
    pub fn remove_closed(&mut self) -> Vec<Connection> {
        let (closed, open): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|c| c.is_closed() && !c.has_events());
        self.items = open;
        closed
    }

    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        self.items
            .iter_mut()
            .flat_map(Connection::drain_events)
            .collect()
    }
}
