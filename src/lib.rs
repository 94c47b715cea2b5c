//! # Observatory Bus
//!
//! The state-synchronization core shared by networked observatory daemons and clients.
//! Every endpoint exposes its live state as named, typed values and keeps mirrors of the
//! values its peers expose, over one line-oriented text protocol.
//!
//! ## Features
//!
//! - **Typed values**: strings, numbers, booleans, enumerated selections, sky coordinates,
//!   bounded doubles, rectangles and arrays, with dirty tracking and self-describing metainfo
//! - **One connection abstraction**: TCP peers, forked helper processes and serial ports
//! - **Command queues**: strict FIFO per connection with a single command in flight
//! - **Event bus**: synchronous, depth-first delivery to registered state machines
//! - **Single-threaded reactor**: no locks anywhere in the core
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use obsbus::{Block, BlockConfig, Value};
//!
//! # async fn demo() -> obsbus::Result<()> {
//! let mut block = Block::new(BlockConfig::default());
//! block.create_value(Value::double("FOC_TAR", "focuser target", 0.0).writable())?;
//! block.listen("127.0.0.1:6170")?;
//!
//! // Serve peers until the process is stopped.
//! block.run().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`value`] - typed values, mirrors and the endpoint's value registry
//! - [`protocol`] - record grammar, tokenizer and line framing
//! - [`command`] - per-connection command queue
//! - [`connection`] - one peer link and its record dispatch
//! - [`fork`] / [`serial`] - process and tty transports
//! - [`event`] - typed events and the listener bus
//! - [`block`] - the reactor tying it all together

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod block;
pub mod command;
pub mod config;
pub mod connection;
pub mod device;
pub mod error;
pub mod event;
pub mod fork;
pub mod protocol;
pub mod script;
pub mod serial;
pub mod value;

pub use block::Block;
pub use command::{Command, CommandHandle, CommandQueue, CommandStatus, Completion};
pub use config::{BlockConfig, ConfigError};
pub use connection::{ConnId, ConnState, Connection, Local, PeerKind};
pub use device::{CommandOutcome, Device, DeviceStatus};
pub use error::{Error, OpError, ParseError, ProtocolError, Result};
pub use event::{CloseReason, CoreEvent, Event, EventBus, EventContext, Listener, ScriptEvent};
pub use fork::{ChildExit, ForkObserver, ForkSpec};
pub use protocol::{Message, MessageType, Record};
pub use script::ScriptRunner;
pub use serial::SerialConfig;
pub use value::{BaseType, DeltaOp, Mirror, Value, ValueFlags, ValueSet, ValueType};
