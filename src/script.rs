use crate::command::{Command, CommandHandle};
use crate::event::{CoreEvent, Event, EventContext, Listener, ScriptEvent};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// Drives one device through a list of command lines per observation target.
///
/// Each line is sent after the previous one completed successfully. A failed command ends
/// the script; a queued next target starts as soon as the current one ends.
#[derive(Debug, Default)]
pub struct ScriptRunner {
    device: String,
    default_script: Vec<String>,
    scripts: HashMap<u32, Vec<String>>,
    current: Option<u32>,
    next: Option<u32>,
    pending: VecDeque<String>,
    running: Option<CommandHandle>,
}

impl ScriptRunner {
    pub fn new(device: impl Into<String>, default_script: &[&str]) -> Self {
        Self {
            device: device.into(),
            default_script: default_script.iter().map(|s| (*s).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_script(mut self, target: u32, lines: &[&str]) -> Self {
        self.scripts
            .insert(target, lines.iter().map(|s| (*s).to_string()).collect());
        self
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn current_target(&self) -> Option<u32> {
        self.current
    }

    pub fn next_target(&self) -> Option<u32> {
        self.next
    }

    /// Lines not yet sent.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn running(&self) -> Option<CommandHandle> {
        self.running
    }

    fn start(&mut self, target: u32, ctx: &mut EventContext<'_>) {
        let script = self.scripts.get(&target).unwrap_or(&self.default_script);
        self.pending = script.iter().cloned().collect();
        self.current = Some(target);
        if self.next == Some(target) {
            self.next = None;
        }
        info!("starting script for target {} on {}", target, self.device);
        ctx.post(ScriptEvent::ScriptStarted { target });
        self.send_next(ctx);
    }

    fn send_next(&mut self, ctx: &mut EventContext<'_>) {
        let Some(line) = self.pending.pop_front() else {
            self.end(ctx);
            return;
        };
        let Some(command) = Command::from_line(&line) else {
            self.send_next(ctx);
            return;
        };
        match ctx.queue_command_to(&self.device, command.with_origin("script")) {
            Ok(handle) => self.running = Some(handle),
            Err(e) => {
                warn!("cannot queue script command {}: {}", line, e);
                self.end(ctx);
            }
        }
    }

    fn end(&mut self, ctx: &mut EventContext<'_>) {
        self.pending.clear();
        self.running = None;
        let Some(target) = self.current.take() else {
            return;
        };
        info!("script for target {} ended", target);
        ctx.post(ScriptEvent::ScriptEnded { target });
        if let Some(next) = self.next.take() {
            ctx.post(ScriptEvent::Observe { target: next });
        }
    }

    fn owns(&self, handle: CommandHandle) -> bool {
        self.running == Some(handle)
    }
}

impl Listener for ScriptRunner {
    fn on_event(&mut self, event: &Event, ctx: &mut EventContext<'_>) {
        match event {
            Event::Script(ScriptEvent::KillAll) => {
                debug!("kill all: dropping script state");
                self.current = None;
                self.next = None;
                self.pending.clear();
                self.running = None;
            }
            Event::Script(ScriptEvent::SetTarget { target }) => self.next = Some(*target),
            Event::Script(ScriptEvent::Observe { target }) if self.current.is_none() => {
                self.start(*target, ctx);
            }
            Event::Script(ScriptEvent::Observe { target }) => self.next = Some(*target),
            Event::Core(CoreEvent::CommandOk { completion }) if self.owns(completion.handle) => {
                self.running = None;
                self.send_next(ctx);
            }
            Event::Core(CoreEvent::CommandFailed { completion })
                if self.owns(completion.handle) =>
            {
                warn!("script command {} failed", completion.line);
                self.end(ctx);
            }
            _ => {}
        }
    }
}
