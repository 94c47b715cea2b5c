use obsbus::connection::{Connection, Local, PeerKind};
use obsbus::event::EVENT_STATUS_CHANGED;
use obsbus::protocol::{Message, MessageType, REPLY_E_PARAMSVAL, REPLY_E_SYSTEM};
use obsbus::value::{BaseType, Value, ValueSet};
use obsbus::{
    CloseReason, Command, CommandOutcome, CommandStatus, ConnId, CoreEvent, Device, DeviceStatus,
    Error, Event, ProtocolError,
};
use std::time::{Duration, Instant};

fn device_link() -> Connection {
    Connection::in_memory(ConnId(1), PeerKind::Device, "FOC")
}

fn output(conn: &mut Connection) -> String {
    String::from_utf8(conn.take_output()).unwrap()
}

fn feed(conn: &mut Connection, values: &mut ValueSet, bytes: &str) {
    let mut local = Local {
        values,
        device: None,
    };
    conn.receive(bytes.as_bytes(), &mut local);
}

fn focuser_values() -> ValueSet {
    let mut values = ValueSet::new();
    values.create(Value::integer("FOC_POS", "focuser position", 0)).unwrap();
    values
        .create(Value::double("FOC_TAR", "focuser target", 0.0).writable())
        .unwrap();
    values
        .create(Value::rectangle("WIN", "readout window", BaseType::Integer).writable())
        .unwrap();
    values.clear_dirty();
    values
}

#[test]
fn test_command_written_only_when_previous_completes() {
    let mut conn = device_link();
    let mut values = ValueSet::new();

    conn.queue_command(Command::new("info")).unwrap();
    conn.queue_command(Command::new("home")).unwrap();
    assert_eq!(output(&mut conn), "info\n");

    feed(&mut conn, &mut values, "+000 \"OK\"\n");
    let events = conn.drain_events();
    assert!(matches!(
        &events[..],
        [Event::Core(CoreEvent::CommandOk { completion })] if completion.line == "info"
    ));
    // The completion came first, then the next command went out
    assert_eq!(output(&mut conn), "home\n");
}

#[test]
fn test_queued_reply_keeps_command_in_flight() {
    let mut conn = device_link();
    let mut values = ValueSet::new();
    conn.queue_command(Command::new("expose")).unwrap();
    conn.queue_command(Command::new("readout")).unwrap();
    output(&mut conn);

    feed(&mut conn, &mut values, "+001 \"queued\"\n");
    assert!(conn.drain_events().is_empty());
    assert_eq!(output(&mut conn), "");

    feed(&mut conn, &mut values, "-001 \"shutter jammed\"\n");
    let events = conn.drain_events();
    let [Event::Core(CoreEvent::CommandFailed { completion })] = &events[..] else {
        panic!("Expected one failed completion, got {:?}", events);
    };
    assert_eq!(completion.code, -1);
    assert_eq!(
        completion.status,
        CommandStatus::Failed("shutter jammed".to_string())
    );
    assert_eq!(output(&mut conn), "readout\n");
}

#[test]
fn test_requeue_reply_resends_on_idle() {
    let mut conn = device_link();
    let mut values = ValueSet::new();
    conn.queue_command(Command::new("expose")).unwrap();
    output(&mut conn);

    feed(&mut conn, &mut values, "-005 \"busy\"\n");
    assert!(conn.drain_events().is_empty());
    assert!(conn.queue().in_flight().is_none());
    assert_eq!(output(&mut conn), "");

    conn.idle(Instant::now());
    assert_eq!(output(&mut conn), "expose\n");
}

#[test]
fn test_close_fails_every_queued_command_in_order() {
    let mut conn = device_link();
    for opcode in ["one", "two", "three"] {
        conn.queue_command(Command::new(opcode)).unwrap();
    }
    conn.close(CloseReason::Requested);
    assert!(conn.is_closed());

    let events = conn.drain_events();
    assert_eq!(events.len(), 4);
    let failed: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            Event::Core(CoreEvent::CommandFailed { completion }) => {
                assert_eq!(completion.code, REPLY_E_SYSTEM);
                Some(completion.line.as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(failed, vec!["one", "two", "three"]);
    assert!(matches!(
        events.last(),
        Some(Event::Core(CoreEvent::ConnectionClosed {
            reason: CloseReason::Requested,
            ..
        }))
    ));

    assert!(matches!(
        conn.queue_command(Command::new("late")),
        Err(Error::ConnectionClosed(_))
    ));
}

#[test]
fn test_unexpected_reply_closes_connection() {
    let mut conn = device_link();
    let mut values = ValueSet::new();
    feed(&mut conn, &mut values, "+000 \"OK\"\nS 1\n");
    assert!(conn.is_closed());

    let events = conn.drain_events();
    assert!(matches!(
        &events[..],
        [Event::Core(CoreEvent::ConnectionClosed {
            reason: CloseReason::Protocol(ProtocolError::UnexpectedReply),
            ..
        })]
    ));
    // Records after the offending reply are not processed
    assert_eq!(conn.status(), DeviceStatus(0));
}

#[test]
fn test_parse_errors_close_after_threshold() {
    let mut conn = device_link();
    conn.set_max_parse_errors(2);
    let mut values = ValueSet::new();

    feed(&mut conn, &mut values, "S bogus\nS bogus\n");
    assert!(!conn.is_closed());
    // A good record resets the count
    feed(&mut conn, &mut values, "S 4\nS bogus\nS bogus\n");
    assert!(!conn.is_closed());
    assert_eq!(conn.status(), DeviceStatus(4));

    feed(&mut conn, &mut values, "S bogus\n");
    assert!(conn.is_closed());
    let events = conn.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Core(CoreEvent::ConnectionClosed {
            reason: CloseReason::Protocol(ProtocolError::TooManyParseErrors(3)),
            ..
        })
    )));
}

#[test]
fn test_metainfo_creates_mirror() {
    let mut conn = device_link();
    let mut values = ValueSet::new();

    // Values before metainfo are ignored
    feed(&mut conn, &mut values, "V FOC_TAR 1\n");
    assert!(conn.mirror("FOC_TAR").is_none());
    assert!(conn.drain_events().is_empty());

    let source = Value::double("FOC_TAR", "focuser target", 150.0).writable();
    let mut lines: String = source
        .meta_records()
        .iter()
        .map(|r| r.to_line() + "\n")
        .collect();
    lines.push_str(&source.value_record().to_line());
    lines.push('\n');
    feed(&mut conn, &mut values, &lines);

    let mirror = conn.mirror("FOC_TAR").unwrap();
    assert!(mirror.is_writable());
    assert_eq!(mirror.as_f64(), Some(150.0));
    assert!(!mirror.is_dirty());
    assert!(matches!(
        &conn.drain_events()[..],
        [Event::Core(CoreEvent::ValueChanged { name, .. })] if name == "FOC_TAR"
    ));
}

#[test]
fn test_line_breaks_in_strings_keep_framing() {
    let mut sender = Connection::in_memory(ConnId(2), PeerKind::Client, "client");
    let mut local_values = ValueSet::new();
    local_values
        .create(Value::string("OBJECT", "target\nname", "line1\nline2"))
        .unwrap();
    sender.send_all(&local_values);
    let wire = output(&mut sender);
    assert_eq!(wire.lines().count(), 2);

    let mut conn = device_link();
    let mut values = ValueSet::new();
    feed(&mut conn, &mut values, &wire);
    let mirror = conn.mirror("OBJECT").unwrap();
    assert_eq!(mirror.as_str(), Some("line1\nline2"));
    assert_eq!(mirror.description(), "target\nname");
    // Nothing was mistaken for a command
    assert_eq!(output(&mut conn), "");
    assert!(!conn.is_closed());
}

#[test]
fn test_selection_mirror_collects_symbols() {
    let mut conn = device_link();
    let mut values = ValueSet::new();
    let filter = Value::selection("FILTER", "filter wheel", &["U", "B", "V"]);
    let mut lines: String = filter
        .meta_records()
        .iter()
        .map(|r| r.to_line() + "\n")
        .collect();
    lines.push_str("V FILTER B\n");
    feed(&mut conn, &mut values, &lines);

    let mirror = conn.mirror("FILTER").unwrap();
    assert_eq!(mirror.as_selection().unwrap().len(), 3);
    assert_eq!(mirror.as_str(), Some("B"));
}

#[test]
fn test_bad_value_text_counts_as_parse_error() {
    let mut conn = device_link();
    conn.set_max_parse_errors(0);
    let mut values = ValueSet::new();
    feed(
        &mut conn,
        &mut values,
        "METAINFO 2 \"FOC_POS\" \"position\"\nV FOC_POS far\n",
    );
    assert!(conn.is_closed());
}

#[test]
fn test_status_change_event() {
    let mut conn = device_link();
    let mut values = ValueSet::new();
    feed(&mut conn, &mut values, "S 0\nS 1\n");
    let events = conn.drain_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        Event::Core(CoreEvent::StatusChanged {
            old: DeviceStatus(0),
            new: DeviceStatus(1),
            ..
        })
    ));
    assert_eq!(events[0].tag(), EVENT_STATUS_CHANGED);
}

#[test]
fn test_set_writable_value() {
    let mut conn = Connection::in_memory(ConnId(2), PeerKind::Client, "client");
    let mut values = focuser_values();

    feed(&mut conn, &mut values, "X FOC_TAR = 150\n");
    assert_eq!(output(&mut conn), "+000 \"OK\"\n");
    let target = values.get("FOC_TAR").unwrap();
    assert_eq!(target.as_f64(), Some(150.0));
    assert!(target.is_dirty());
    assert!(matches!(
        &conn.drain_events()[..],
        [Event::Core(CoreEvent::ValueSet { name, .. })] if name == "FOC_TAR"
    ));

    feed(&mut conn, &mut values, "X FOC_TAR += 25\n");
    assert_eq!(values.get("FOC_TAR").unwrap().as_f64(), Some(175.0));

    // Shorthand assignment
    feed(&mut conn, &mut values, "FOC_TAR 10\n");
    assert_eq!(values.get("FOC_TAR").unwrap().as_f64(), Some(10.0));
}

#[test]
fn test_set_rejections() {
    let mut conn = Connection::in_memory(ConnId(2), PeerKind::Client, "client");
    let mut values = focuser_values();
    output(&mut conn);

    feed(&mut conn, &mut values, "X FOC_POS = 5\n");
    assert!(output(&mut conn).starts_with("-003 "));
    feed(&mut conn, &mut values, "X NOPE = 5\n");
    assert!(output(&mut conn).starts_with("-003 "));
    feed(&mut conn, &mut values, "X FOC_TAR = far\n");
    assert!(output(&mut conn).starts_with("-003 "));
    feed(&mut conn, &mut values, "X WIN = 1 2 3\n");
    assert!(output(&mut conn).starts_with("-003 "));

    assert_eq!(values.get("FOC_POS").unwrap().as_i64(), Some(0));
    assert_eq!(values.get("WIN").unwrap().serialize(), "0 0 0 0");
    assert!(!values.has_dirty());
    assert!(!conn.is_closed());
}

struct Limited;

impl Device for Limited {
    fn set_value(&mut self, _old: &Value, new: &Value) -> Result<(), String> {
        match new.as_f64() {
            Some(v) if v > 1000.0 => Err("beyond travel".to_string()),
            _ => Ok(()),
        }
    }

    fn command(&mut self, opcode: &str, params: &str, _values: &mut ValueSet) -> CommandOutcome {
        match opcode {
            "home" if params.is_empty() => CommandOutcome::Ok,
            "home" => CommandOutcome::Failed {
                code: REPLY_E_PARAMSVAL,
                reason: "home takes no parameters".to_string(),
            },
            "busy" => CommandOutcome::Requeue,
            _ => CommandOutcome::Unknown,
        }
    }
}

#[test]
fn test_device_hooks() {
    let mut conn = Connection::in_memory(ConnId(2), PeerKind::Client, "client");
    let mut values = focuser_values();
    let mut device = Limited;
    let mut local = Local {
        values: &mut values,
        device: Some(&mut device),
    };

    conn.receive(b"X FOC_TAR = 5000\n", &mut local);
    assert_eq!(output(&mut conn), "-001 \"beyond travel\"\n");
    assert_eq!(local.values.get("FOC_TAR").unwrap().as_f64(), Some(0.0));

    conn.receive(b"home\nhome now\nbusy\nfly\n", &mut local);
    assert_eq!(
        output(&mut conn),
        "+000 \"OK\"\n-003 \"home takes no parameters\"\n-005 \"retry later\"\n-002 \"unknown command fly\"\n"
    );
}

#[test]
fn test_unknown_command_without_device() {
    let mut conn = Connection::in_memory(ConnId(2), PeerKind::Client, "client");
    let mut values = ValueSet::new();
    feed(&mut conn, &mut values, "fly away\n");
    assert_eq!(output(&mut conn), "-002 \"unknown command fly\"\n");
}

#[test]
fn test_info_sends_metainfo_once() {
    let mut conn = Connection::in_memory(ConnId(2), PeerKind::Client, "client");
    let mut values = focuser_values();

    feed(&mut conn, &mut values, "info\n");
    let first = output(&mut conn);
    assert_eq!(first.matches("METAINFO").count(), 3);
    assert!(first.contains("V FOC_TAR "));
    assert!(first.ends_with("+000 \"OK\"\n"));

    feed(&mut conn, &mut values, "info\n");
    let second = output(&mut conn);
    assert!(!second.contains("METAINFO"));
    assert_eq!(second.lines().count(), 4);
}

#[test]
fn test_dirty_values_reach_subscribers_only() {
    let mut values = focuser_values();
    values.set("FOC_TAR", "42").unwrap();

    let mut client = Connection::in_memory(ConnId(2), PeerKind::Client, "client");
    client.broadcast_dirty(&values);
    let pushed = output(&mut client);
    assert!(pushed.starts_with("METAINFO "));
    assert!(pushed.contains("V FOC_TAR "));
    assert!(!pushed.contains("FOC_POS"));

    let mut device = device_link();
    device.broadcast_dirty(&values);
    assert_eq!(output(&mut device), "");
}

#[test]
fn test_keepalive_then_timeout() {
    let mut conn = device_link();
    conn.set_timeout(Some(Duration::from_secs(8)));
    let start = Instant::now();

    conn.idle(start + Duration::from_secs(1));
    assert_eq!(output(&mut conn), "");

    conn.idle(start + Duration::from_secs(3));
    assert_eq!(output(&mut conn), "T ready\n");
    // Not again until another quarter of the timeout passed
    conn.idle(start + Duration::from_secs(4));
    assert_eq!(output(&mut conn), "");

    conn.idle(start + Duration::from_secs(9));
    assert!(conn.is_closed());
    assert!(conn.drain_events().iter().any(|e| matches!(
        e,
        Event::Core(CoreEvent::ConnectionClosed {
            reason: CloseReason::Timeout,
            ..
        })
    )));
}

#[test]
fn test_keepalive_answered() {
    let mut conn = device_link();
    let mut values = ValueSet::new();
    feed(&mut conn, &mut values, "T ready\nT OK\n");
    assert_eq!(output(&mut conn), "T OK\n");
}

#[test]
fn test_no_timeout_when_disabled() {
    let mut conn = device_link();
    conn.set_timeout(None);
    conn.idle(Instant::now() + Duration::from_secs(3600));
    assert!(!conn.is_closed());
    assert_eq!(output(&mut conn), "");
}

#[test]
fn test_messages_become_events() {
    let mut conn = device_link();
    let mut values = ValueSet::new();
    let message = Message::new("FOC", MessageType::Error, "motor stalled");
    feed(&mut conn, &mut values, &(message.to_line() + "\n"));

    let events = conn.drain_events();
    let [Event::Core(CoreEvent::Message { message: received, .. })] = &events[..] else {
        panic!("Expected one message event, got {:?}", events);
    };
    assert_eq!(received.text, "motor stalled");
    assert_eq!(received.kind, MessageType::Error);
}
