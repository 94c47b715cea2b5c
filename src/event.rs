//! In-process typed broadcast between the reactor and the state machines built on it.
//!
//! Delivery is synchronous and depth-first: an event posted by a listener reaches every
//! listener before the event that provoked it moves on to the next one.

use crate::command::{Command, CommandHandle, Completion};
use crate::connection::{ConnId, Connection, Connections};
use crate::device::DeviceStatus;
use crate::error::{Error, ProtocolError, Result};
use crate::fork::ChildExit;
use crate::protocol::Message;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{trace, warn};

pub const MAX_EVENT_DEPTH: usize = 32;

// Core tags stay below 1000; each local subsystem owns a range above it.
pub const EVENT_CONNECTION_ESTABLISHED: u32 = 1;
pub const EVENT_CONNECTION_CLOSED: u32 = 2;
pub const EVENT_SET_TARGET: u32 = 3;
pub const EVENT_OBSERVE: u32 = 4;
pub const EVENT_VALUE_CHANGED: u32 = 5;
pub const EVENT_VALUE_SET: u32 = 6;
pub const EVENT_STATUS_CHANGED: u32 = 7;
pub const EVENT_MESSAGE: u32 = 8;
pub const EVENT_CHILD_ENDED: u32 = 9;
pub const EVENT_COMMAND_OK: u32 = 16;
pub const EVENT_COMMAND_FAILED: u32 = 17;

pub const EVENT_SCRIPT_ENDED: u32 = 1050;
pub const EVENT_SCRIPT_STARTED: u32 = 1052;
pub const EVENT_KILL_ALL: u32 = 1053;

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    Requested,
    PeerClosed,
    Timeout,
    Io(String),
    Protocol(ProtocolError),
    ChildEnded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    ConnectionEstablished {
        conn: ConnId,
        name: String,
    },
    ConnectionClosed {
        conn: ConnId,
        name: String,
        reason: CloseReason,
    },
    CommandOk {
        completion: Completion,
    },
    CommandFailed {
        completion: Completion,
    },
    /// A mirror of a peer value was replicated.
    ValueChanged {
        conn: ConnId,
        name: String,
    },
    /// A peer changed one of our writable values.
    ValueSet {
        conn: ConnId,
        name: String,
    },
    StatusChanged {
        conn: ConnId,
        old: DeviceStatus,
        new: DeviceStatus,
    },
    Message {
        conn: ConnId,
        message: Message,
    },
    ChildEnded {
        conn: ConnId,
        pid: i32,
        exit: ChildExit,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    KillAll,
    SetTarget { target: u32 },
    Observe { target: u32 },
    ScriptStarted { target: u32 },
    ScriptEnded { target: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Core(CoreEvent),
    Script(ScriptEvent),
}

impl Event {
    pub fn tag(&self) -> u32 {
        match self {
            Event::Core(core) => match core {
                CoreEvent::ConnectionEstablished { .. } => EVENT_CONNECTION_ESTABLISHED,
                CoreEvent::ConnectionClosed { .. } => EVENT_CONNECTION_CLOSED,
                CoreEvent::CommandOk { .. } => EVENT_COMMAND_OK,
                CoreEvent::CommandFailed { .. } => EVENT_COMMAND_FAILED,
                CoreEvent::ValueChanged { .. } => EVENT_VALUE_CHANGED,
                CoreEvent::ValueSet { .. } => EVENT_VALUE_SET,
                CoreEvent::StatusChanged { .. } => EVENT_STATUS_CHANGED,
                CoreEvent::Message { .. } => EVENT_MESSAGE,
                CoreEvent::ChildEnded { .. } => EVENT_CHILD_ENDED,
            },
            Event::Script(script) => match script {
                ScriptEvent::KillAll => EVENT_KILL_ALL,
                ScriptEvent::SetTarget { .. } => EVENT_SET_TARGET,
                ScriptEvent::Observe { .. } => EVENT_OBSERVE,
                ScriptEvent::ScriptStarted { .. } => EVENT_SCRIPT_STARTED,
                ScriptEvent::ScriptEnded { .. } => EVENT_SCRIPT_ENDED,
            },
        }
    }
}

impl From<CoreEvent> for Event {
    fn from(event: CoreEvent) -> Self {
        Event::Core(event)
    }
}

impl From<ScriptEvent> for Event {
    fn from(event: ScriptEvent) -> Self {
        Event::Script(event)
    }
}

/// What a listener may touch while handling an event.
pub struct EventContext<'a> {
    connections: &'a mut Connections,
    posted: Vec<Event>,
}

impl<'a> EventContext<'a> {
    pub fn new(connections: &'a mut Connections) -> Self {
        Self {
            connections,
            posted: Vec::new(),
        }
    }

    /// Deliver `event` to every listener once the current listener returns.
    pub fn post(&mut self, event: impl Into<Event>) {
        self.posted.push(event.into());
    }

    pub fn queue_command(&mut self, conn: ConnId, command: Command) -> Result<CommandHandle> {
        self.connections
            .get_mut(conn)
            .ok_or(Error::UnknownConnection(conn))?
            .queue_command(command)
    }

    pub fn queue_command_to(&mut self, peer: &str, command: Command) -> Result<CommandHandle> {
        self.connections
            .by_name_mut(peer)
            .ok_or_else(|| Error::UnknownPeer(peer.to_string()))?
            .queue_command(command)
    }

    pub fn connection(&self, conn: ConnId) -> Option<&Connection> {
        self.connections.get(conn)
    }

    pub fn connection_by_name(&self, peer: &str) -> Option<&Connection> {
        self.connections.by_name(peer)
    }

    fn into_posted(self) -> Vec<Event> {
        self.posted
    }
}

pub trait Listener {
    fn on_event(&mut self, event: &Event, ctx: &mut EventContext<'_>);
}

/// Lets the owner keep a handle on a listener it registered.
impl<L: Listener> Listener for Rc<RefCell<L>> {
    fn on_event(&mut self, event: &Event, ctx: &mut EventContext<'_>) {
        self.borrow_mut().on_event(event, ctx);
    }
}

#[derive(Default)]
pub struct EventBus {
    listeners: Vec<Box<dyn Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn post(&mut self, event: &Event, connections: &mut Connections) {
        self.deliver(event, connections, 0);
    }

    fn deliver(&mut self, event: &Event, connections: &mut Connections, depth: usize) {
        if depth >= MAX_EVENT_DEPTH {
            warn!(tag = event.tag(), depth, "event recursion too deep, dropping event");
            return;
        }
        trace!(tag = event.tag(), depth, "delivering event");

        for index in 0..self.listeners.len() {
            let mut ctx = EventContext::new(connections);
            self.listeners[index].on_event(event, &mut ctx);
            for posted in ctx.into_posted() {
                self.deliver(&posted, connections, depth + 1);
            }
        }
    }
}
