//! The reactor owning every connection of one endpoint.
//!
//! One pass of [`Block::tick`] waits (bounded by the idle timeout) until something is ready,
//! then accepts, finishes connects, drains every readable connection, delivers the events
//! that produced and flushes every writable connection. Closed connections are removed only
//! after their events were delivered, and [`Block::idle`] runs after every pass.

use crate::command::{Command, CommandHandle};
use crate::config::BlockConfig;
use crate::connection::{ConnId, Connection, Connections, Local, PeerKind};
use crate::device::{Device, DeviceStatus};
use crate::error::{Error, OpError, Result};
use crate::event::{CloseReason, CoreEvent, Event, EventBus, Listener};
use crate::fork::{self, ForkObserver, ForkSpec, ForkState};
use crate::protocol::{Message, MessageType};
use crate::serial::{SerialConfig, SerialLink};
use crate::value::{Value, ValueSet};
use std::future::poll_fn;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub struct Block {
    config: BlockConfig,
    listener: Option<TcpListener>,
    connections: Connections,
    values: ValueSet,
    device: Option<Box<dyn Device>>,
    bus: EventBus,
    status: DeviceStatus,
    pending: Vec<Event>,
    // Children of removed fork connections, still to be reaped.
    orphans: Vec<i32>,
    running: bool,
}

impl Block {
    pub fn new(config: BlockConfig) -> Self {
        Self {
            config,
            listener: None,
            connections: Connections::new(),
            values: ValueSet::new(),
            device: None,
            bus: EventBus::new(),
            status: DeviceStatus::default(),
            pending: Vec::new(),
            orphans: Vec::new(),
            running: false,
        }
    }

    pub fn config(&self) -> &BlockConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Accept peers on `address`. Must run inside a tokio runtime.
    pub fn listen(&mut self, address: &str) -> Result<SocketAddr> {
        let listener = std::net::TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local = listener.local_addr()?;
        info!("{} listening on {}", self.config.name, local);
        self.listener = Some(listener);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn next_conn_id(&mut self) -> ConnId {
        self.connections.allocate_id()
    }

    fn configure(&self, conn: &mut Connection) {
        if conn.kind().default_timeout().is_some() {
            conn.set_timeout(self.config.connection_timeout());
        }
        conn.set_max_parse_errors(self.config.max_parse_errors);
        conn.set_record_limit(self.config.max_record_size);
    }

    /// Register a connection built by the caller, e.g. [`Connection::in_memory`].
    pub fn add_connection(&mut self, mut conn: Connection) -> ConnId {
        self.configure(&mut conn);
        if conn.is_established() && conn.kind().subscribes() {
            conn.send_status(self.status);
        }
        self.connections.insert(conn)
    }

    /// Non-blocking connect; commands queued meanwhile are sent once it completes.
    pub fn connect(&mut self, name: &str, address: &str, kind: PeerKind) -> ConnId {
        let id = self.next_conn_id();
        self.add_connection(Connection::connecting(id, kind, name, address))
    }

    pub fn attach(&mut self, name: &str, kind: PeerKind, stream: TcpStream) -> ConnId {
        let id = self.next_conn_id();
        self.add_connection(Connection::from_stream(id, kind, name, stream))
    }

    /// Fork `spec` and wire its pipes in as a connection. With `export_state` the child's
    /// environment describes every tracked peer.
    pub fn spawn_fork(
        &mut self,
        spec: ForkSpec,
        observer: Option<Box<dyn ForkObserver>>,
        export_state: bool,
    ) -> Result<ConnId> {
        let mut spec = spec;
        if spec.timeout.is_none() {
            spec.timeout = self.config.fork_timeout();
        }
        if export_state {
            spec.env.extend(fork::environment(&self.connections));
        }
        let (link, state) = fork::spawn(&spec, observer)?;
        let id = self.next_conn_id();
        let conn = Connection::from_stream(id, PeerKind::Fork, &spec.name, link).with_fork(state);
        Ok(self.add_connection(conn))
    }

    pub fn open_serial(&mut self, name: &str, config: &SerialConfig) -> Result<ConnId> {
        let link = SerialLink::open(config)?;
        let id = self.next_conn_id();
        Ok(self.add_connection(Connection::from_stream(id, PeerKind::Serial, name, link)))
    }

    pub fn add_listener(&mut self, listener: impl Listener + 'static) {
        self.bus.add_listener(Box::new(listener));
    }

    pub fn set_device(&mut self, device: impl Device + 'static) {
        self.device = Some(Box::new(device));
    }

    pub fn create_value(&mut self, value: Value) -> std::result::Result<&mut Value, OpError> {
        self.values.create(value)
    }

    pub fn values(&self) -> &ValueSet {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueSet {
        &mut self.values
    }

    pub fn connections(&self) -> &Connections {
        &self.connections
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    pub fn connection_by_name(&self, name: &str) -> Option<&Connection> {
        self.connections.by_name(name)
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

    /// Deliver `event` to every listener before returning.
    pub fn post_event(&mut self, event: impl Into<Event>) {
        self.pending.push(event.into());
        self.deliver_pending();
    }

    pub fn close(&mut self, conn: ConnId) -> Result<()> {
        self.connections
            .get_mut(conn)
            .ok_or(Error::UnknownConnection(conn))?
            .close(CloseReason::Requested);
        self.deliver_pending();
        Ok(())
    }

    pub fn status(&self) -> DeviceStatus {
        self.status
    }

    /// Change the bits under `mask` and announce the new status to subscribers.
    pub fn set_status(&mut self, mask: u32, bits: u32) {
        let status = self.status.with(mask, bits);
        if status == self.status {
            return;
        }
        debug!("{} status {} -> {}", self.config.name, self.status, status);
        self.status = status;
        for conn in self.subscribers() {
            conn.send_status(status);
        }
    }

    fn subscribers(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections
            .iter_mut()
            .filter(|c| c.kind().subscribes() && c.is_established())
    }

    /// Push every value to every subscriber.
    pub fn info_all(&mut self) {
        let Block {
            connections,
            values,
            ..
        } = self;
        for conn in connections
            .iter_mut()
            .filter(|c| c.kind().subscribes() && c.is_established())
        {
            conn.send_all(values);
        }
        values.clear_dirty();
    }

    pub fn broadcast_message(&mut self, kind: MessageType, text: &str) {
        let message = Message::new(&self.config.name, kind, text);
        for conn in self.subscribers() {
            conn.send_message(&message);
        }
    }

    /// Feed bytes to a connection as if its transport produced them, then deliver events.
    pub fn receive(&mut self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        let Block {
            connections,
            values,
            device,
            ..
        } = self;
        let connection = connections
            .get_mut(conn)
            .ok_or(Error::UnknownConnection(conn))?;
        let mut local = Local {
            values,
            device: device.as_deref_mut(),
        };
        connection.receive(bytes, &mut local);
        self.deliver_pending();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub async fn run(&mut self) {
        self.running = true;
        info!("{} running", self.config.name);
        while self.running {
            self.tick().await;
        }
    }

    /// Stop [`run`](Self::run) after the current pass and close every connection.
    pub fn shutdown(&mut self) {
        self.running = false;
        for conn in self.connections.iter_mut() {
            conn.close(CloseReason::Requested);
        }
        self.deliver_pending();
    }

    pub async fn tick(&mut self) {
        let wait = self.config.idle_timeout();
        let _ = tokio::time::timeout(wait, poll_fn(|cx| self.poll_io(cx))).await;
        self.remove_closed();
        self.idle(Instant::now());
    }

    fn poll_io(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        let mut progress = self.poll_accept(cx);
        progress |= self.poll_read(cx);
        progress |= self.deliver_pending();
        progress |= self.poll_write(cx);
        progress |= self.deliver_pending();
        if progress {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    fn poll_accept(&mut self, cx: &mut Context<'_>) -> bool {
        let mut accepted = Vec::new();
        if let Some(listener) = &self.listener {
            loop {
                match listener.poll_accept(cx) {
                    Poll::Ready(Ok(peer)) => accepted.push(peer),
                    Poll::Ready(Err(e)) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        let progress = !accepted.is_empty();
        for (stream, address) in accepted {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("cannot disable nagle for {}: {}", address, e);
            }
            let id = self.attach(&address.to_string(), PeerKind::Client, stream);
            info!(conn = %id, "accepted {}", address);
            self.pending.push(
                CoreEvent::ConnectionEstablished {
                    conn: id,
                    name: address.to_string(),
                }
                .into(),
            );
        }
        progress
    }

    fn poll_read(&mut self, cx: &mut Context<'_>) -> bool {
        let Block {
            connections,
            values,
            device,
            ..
        } = self;
        let mut progress = false;
        for conn in connections.iter_mut() {
            progress |= conn.poll_connect(cx).is_ready();
            let mut local = Local {
                values: &mut *values,
                device: device.as_deref_mut(),
            };
            progress |= conn.on_readable(cx, &mut local).is_ready();
            progress |= conn.poll_stderr(cx).is_ready();
        }
        progress
    }

    fn poll_write(&mut self, cx: &mut Context<'_>) -> bool {
        let mut progress = false;
        for conn in self.connections.iter_mut().filter(|c| c.wants_write()) {
            progress |= conn.on_writable(cx).is_ready();
        }
        progress
    }

    /// Deliver queued and connection-produced events until none are left.
    fn deliver_pending(&mut self) -> bool {
        let mut delivered = false;
        loop {
            let mut events = std::mem::take(&mut self.pending);
            events.extend(self.connections.take_events());
            if events.is_empty() {
                return delivered;
            }
            delivered = true;
            for event in &events {
                self.bus.post(event, &mut self.connections);
            }
        }
    }

    fn remove_closed(&mut self) {
        self.deliver_pending();
        for conn in self.connections.remove_closed() {
            debug!(conn = %conn.id(), "removing {}", conn.name());
            if let Some(fork) = conn.fork().filter(|f| !f.is_reaped()) {
                self.orphans.push(fork.pid());
            }
        }
    }

    /// Per-pass housekeeping: reap children, connection timers, the device hook and the
    /// dirty-value broadcast.
    pub fn idle(&mut self, now: Instant) {
        self.reap_children();
        for conn in self.connections.iter_mut() {
            conn.idle(now);
        }
        let mut requested = None;
        if let Some(device) = self.device.as_deref_mut() {
            device.idle(&mut self.values);
            requested = device.status();
        }
        if let Some((mask, bits)) = requested {
            self.set_status(mask, bits);
        }
        self.broadcast_dirty();
        self.remove_closed();
    }

    fn reap_children(&mut self) {
        for conn in self.connections.iter_mut() {
            let Some(pid) = conn.fork().filter(|f| !f.is_reaped()).map(ForkState::pid) else {
                continue;
            };
            if let Some(exit) = fork::try_reap(pid) {
                conn.child_returned(exit);
            }
        }
        self.orphans.retain(|&pid| fork::try_reap(pid).is_none());
    }

    fn broadcast_dirty(&mut self) {
        if !self.values.has_dirty() {
            return;
        }
        let Block {
            connections,
            values,
            ..
        } = self;
        for conn in connections.iter_mut() {
            conn.broadcast_dirty(values);
        }
        values.clear_dirty();
    }
}
