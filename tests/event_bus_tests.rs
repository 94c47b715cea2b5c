use obsbus::connection::{Connection, Connections, PeerKind};
use obsbus::event::{MAX_EVENT_DEPTH, EVENT_KILL_ALL, EVENT_SET_TARGET};
use obsbus::{
    Block, BlockConfig, Command, ConnId, Event, EventBus, EventContext, Listener, ScriptEvent,
    ScriptRunner,
};
use std::cell::RefCell;
use std::rc::Rc;

type Log = Rc<RefCell<Vec<String>>>;

/// Records every event it sees and optionally reacts to one target with another.
struct Recorder {
    name: &'static str,
    log: Log,
    react: Option<(u32, u32)>,
}

impl Listener for Recorder {
    fn on_event(&mut self, event: &Event, ctx: &mut EventContext<'_>) {
        let target = match event {
            Event::Script(ScriptEvent::SetTarget { target }) => *target,
            _ => return,
        };
        self.log.borrow_mut().push(format!("{}:{}", self.name, target));
        if let Some((from, to)) = self.react {
            if from == target {
                ctx.post(ScriptEvent::SetTarget { target: to });
            }
        }
    }
}

#[test]
fn test_listeners_see_events_in_registration_order() {
    let log = Log::default();
    let mut bus = EventBus::new();
    for name in ["a", "b", "c"] {
        bus.add_listener(Box::new(Recorder {
            name,
            log: Rc::clone(&log),
            react: None,
        }));
    }
    let mut connections = Connections::new();
    bus.post(&ScriptEvent::SetTarget { target: 1 }.into(), &mut connections);
    assert_eq!(*log.borrow(), vec!["a:1", "b:1", "c:1"]);
}

#[test]
fn test_posted_events_are_delivered_depth_first() {
    let log = Log::default();
    let mut bus = EventBus::new();
    bus.add_listener(Box::new(Recorder {
        name: "a",
        log: Rc::clone(&log),
        react: Some((1, 2)),
    }));
    bus.add_listener(Box::new(Recorder {
        name: "b",
        log: Rc::clone(&log),
        react: None,
    }));

    let mut connections = Connections::new();
    bus.post(&ScriptEvent::SetTarget { target: 1 }.into(), &mut connections);
    // The follow-up reaches everyone before b sees the original
    assert_eq!(*log.borrow(), vec!["a:1", "a:2", "b:2", "b:1"]);
}

/// Reposts every event it receives.
struct Echo {
    seen: Rc<RefCell<usize>>,
}

impl Listener for Echo {
    fn on_event(&mut self, event: &Event, ctx: &mut EventContext<'_>) {
        *self.seen.borrow_mut() += 1;
        ctx.post(event.clone());
    }
}

#[test]
fn test_runaway_recursion_is_bounded() {
    let seen = Rc::new(RefCell::new(0));
    let mut bus = EventBus::new();
    bus.add_listener(Box::new(Echo {
        seen: Rc::clone(&seen),
    }));
    let mut connections = Connections::new();
    bus.post(&ScriptEvent::KillAll.into(), &mut connections);
    assert_eq!(*seen.borrow(), MAX_EVENT_DEPTH);
}

#[test]
fn test_event_tags() {
    assert_eq!(Event::from(ScriptEvent::KillAll).tag(), EVENT_KILL_ALL);
    assert_eq!(
        Event::from(ScriptEvent::SetTarget { target: 3 }).tag(),
        EVENT_SET_TARGET
    );
}

/// Queues a command on every target change.
struct Commander;

impl Listener for Commander {
    fn on_event(&mut self, event: &Event, ctx: &mut EventContext<'_>) {
        if let Event::Script(ScriptEvent::SetTarget { target }) = event {
            ctx.queue_command_to("FOC", Command::new("move").param(target))
                .unwrap();
            assert!(ctx.queue_command_to("NOBODY", Command::new("move")).is_err());
        }
    }
}

#[test]
fn test_listener_queues_commands_through_context() {
    let mut bus = EventBus::new();
    bus.add_listener(Box::new(Commander));
    let mut connections = Connections::new();
    let id = connections.allocate_id();
    connections.insert(Connection::in_memory(id, PeerKind::Device, "FOC"));

    bus.post(&ScriptEvent::SetTarget { target: 9 }.into(), &mut connections);
    let conn = connections.get_mut(id).unwrap();
    assert_eq!(conn.take_output(), b"move 9\n");
}

fn script_block() -> (Block, ConnId, Rc<RefCell<ScriptRunner>>) {
    let mut block = Block::new(BlockConfig::default());
    let id = block.next_conn_id();
    block.add_connection(Connection::in_memory(id, PeerKind::Device, "CCD"));
    let runner = Rc::new(RefCell::new(
        ScriptRunner::new("CCD", &["filter V", "expose 10"]).with_script(7, &["expose 30"]),
    ));
    block.add_listener(Rc::clone(&runner));
    (block, id, runner)
}

fn sent(block: &mut Block, id: ConnId) -> String {
    String::from_utf8(block.connection_mut(id).unwrap().take_output()).unwrap()
}

#[test]
fn test_script_runs_lines_in_sequence() {
    let (mut block, id, runner) = script_block();
    block.post_event(ScriptEvent::Observe { target: 1 });
    assert_eq!(runner.borrow().current_target(), Some(1));
    assert_eq!(sent(&mut block, id), "filter V\n");

    block.receive(id, b"+000 \"OK\"\n").unwrap();
    assert_eq!(sent(&mut block, id), "expose 10\n");

    block.receive(id, b"+000 \"OK\"\n").unwrap();
    assert_eq!(runner.borrow().current_target(), None);
    assert_eq!(sent(&mut block, id), "");
}

#[test]
fn test_next_target_starts_after_current_ends() {
    let (mut block, id, runner) = script_block();
    block.post_event(ScriptEvent::Observe { target: 1 });
    block.post_event(ScriptEvent::Observe { target: 7 });
    assert_eq!(runner.borrow().current_target(), Some(1));
    assert_eq!(runner.borrow().next_target(), Some(7));
    sent(&mut block, id);

    // A failed line ends the script and the queued target takes over
    block.receive(id, b"-001 \"filter wheel stuck\"\n").unwrap();
    assert_eq!(runner.borrow().current_target(), Some(7));
    assert_eq!(runner.borrow().next_target(), None);
    assert_eq!(sent(&mut block, id), "expose 30\n");
}

#[test]
fn test_kill_all_resets_script_state() {
    let (mut block, id, runner) = script_block();
    block.post_event(ScriptEvent::SetTarget { target: 7 });
    block.post_event(ScriptEvent::Observe { target: 1 });
    assert!(runner.borrow().running().is_some());

    block.post_event(ScriptEvent::KillAll);
    let state = runner.borrow();
    assert_eq!(state.current_target(), None);
    assert_eq!(state.next_target(), None);
    assert_eq!(state.pending(), 0);
    assert!(state.running().is_none());
    drop(state);

    // The reply to the abandoned command no longer drives the script
    sent(&mut block, id);
    block.receive(id, b"+000 \"OK\"\n").unwrap();
    assert_eq!(sent(&mut block, id), "");
}
