use obsbus::value::{
    BaseType, DeltaOp, DisplayHint, Scalar, Value, ValueData, ValueFlags, ValueSet, ValueType,
};
use obsbus::{Mirror, OpError};

#[test]
fn test_scalar_serialize_round_trip() {
    let mut source = Value::double("FOC_TAR", "focuser target", 12.5);
    let mut copy = Value::double("FOC_TAR", "focuser target", 0.0);
    copy.set(&source.serialize()).unwrap();
    assert!(copy.is_equal(&source));

    // Strings with spaces and quotes survive quoting
    source = Value::string("OBJECT", "target name", "M 31 \"Andromeda\"");
    let mut name = Value::string("OBJECT", "target name", "");
    name.set(&source.serialize()).unwrap();
    assert_eq!(name.as_str(), Some("M 31 \"Andromeda\""));
}

/// Copy `source` through its wire text into a fresh value of the same shape.
fn replicate(source: &Value, mut copy: Value) -> Value {
    copy.set(&source.serialize()).unwrap();
    assert_eq!(copy.serialize(), source.serialize(), "{}", source.name());
    copy
}

#[test]
fn test_every_value_type_round_trips() {
    let scalars = [
        (BaseType::String, "\"two words\""),
        (BaseType::Integer, "-42"),
        (BaseType::Long, "-9000000000"),
        (BaseType::Time, "1700000000.25"),
        (BaseType::Double, "0.1"),
        (BaseType::Float, "0.1"),
        (BaseType::Bool, "true"),
        (BaseType::RaDec, "10.5 -20.25"),
        (BaseType::AltAz, "45 180"),
    ];
    for (base, text) in scalars {
        let mut source = Value::new("S", "", ValueType::Scalar(base));
        source.set(text).unwrap();
        let copy = replicate(&source, Value::new("S", "", ValueType::Scalar(base)));
        assert!(copy.is_equal(&source), "{base:?}");

        let mut items = Value::array("A", "", base);
        items.set(&format!("{text} {text}")).unwrap();
        assert_eq!(items.as_array().unwrap().len(), 2);
        replicate(&items, Value::array("A", "", base));
    }

    // The default bounded double is NaN over an unbounded range
    let bounded = Value::new("M", "", ValueType::MinMax);
    assert_eq!(bounded.serialize(), "nan -inf inf");
    let copy = replicate(&bounded, Value::new("M", "", ValueType::MinMax));
    assert!(copy.as_f64().unwrap().is_nan());
    let limited = Value::min_max("CCD_SET", "", -20.0, -50.0, 10.0);
    replicate(&limited, Value::new("CCD_SET", "", ValueType::MinMax));

    let mut filter = Value::selection("FILTER", "", &["U", "B", "V"]);
    filter.set("B").unwrap();
    replicate(&filter, Value::selection("FILTER", "", &["U", "B", "V"]));

    let mut window = Value::rectangle("WIN", "", BaseType::Integer);
    window.set("1 2 1024 2048").unwrap();
    let copy = replicate(&window, Value::rectangle("WIN", "", BaseType::Integer));
    let pairs = window
        .as_rectangle()
        .unwrap()
        .children()
        .into_iter()
        .zip(copy.as_rectangle().unwrap().children());
    for (ours, theirs) in pairs {
        assert_eq!(theirs.name(), ours.name());
        assert!(theirs.is_equal(ours));
    }
}

#[test]
fn test_numeric_selection_symbols_win_over_indices() {
    let symbols = ["1", "2", "4"];
    let mut binning = Value::selection("BINNING", "binning", &symbols);
    binning.set_selection("2").unwrap();
    assert_eq!(binning.as_i64(), Some(1));
    assert_eq!(binning.serialize(), "2");

    binning.set("4").unwrap();
    assert_eq!(binning.as_i64(), Some(2));
    let copy = replicate(&binning, Value::selection("BINNING", "binning", &symbols));
    assert_eq!(copy.as_str(), Some("4"));

    // Numbers that name no symbol still select by index
    binning.set("0").unwrap();
    assert_eq!(binning.as_str(), Some("1"));
}

#[test]
fn test_string_with_line_breaks_stays_on_one_line() {
    let source = Value::string("OBJECT", "name", "line1\nline2\r\0end");
    let wire = source.serialize();
    assert!(!wire.contains('\n') && !wire.contains('\r'));
    assert_eq!(wire, "\"line1\\nline2\\r\\0end\"");
    let copy = replicate(&source, Value::string("OBJECT", "name", ""));
    assert_eq!(copy.as_str(), Some("line1\nline2\r\0end"));
}

#[test]
fn test_unquoted_string_takes_whole_text() {
    let mut value = Value::string("OBJECT", "target name", "");
    value.set("  NGC 7000 field  ").unwrap();
    assert_eq!(value.as_str(), Some("NGC 7000 field"));
}

#[test]
fn test_nan_double() {
    let mut value = Value::new("AIRMASS", "airmass", ValueType::Scalar(BaseType::Double));
    assert!(value.as_f64().unwrap().is_nan());
    assert_eq!(value.serialize(), "nan");
    assert_eq!(value.display_value(), "nan");

    value.set("1.25").unwrap();
    assert_eq!(value.as_f64(), Some(1.25));
    value.set("NaN").unwrap();
    assert!(value.as_f64().unwrap().is_nan());
}

#[test]
fn test_integer_rejects_garbage() {
    let mut value = Value::integer("FOC_POS", "position", 10);
    assert!(value.set("ten").is_err());
    assert!(value.set("1 2").is_err());
    assert_eq!(value.as_i64(), Some(10));
}

#[test]
fn test_bool_accepts_common_spellings() {
    let mut value = Value::boolean("COOLING", "cooler on", false);
    for (text, expected) in [("on", true), ("off", false), ("true", true), ("0", false), ("YES", true)] {
        value.set(text).unwrap();
        assert_eq!(value.as_bool(), Some(expected), "parsing {}", text);
    }
    assert!(value.set("maybe").is_err());
    assert_eq!(value.serialize(), "true");
}

#[test]
fn test_radec_parses_sexagesimal() {
    let mut value = Value::radec("TEL", "telescope position", 0.0, 0.0);
    value.set("1:20 -10:30").unwrap();
    let mut copy = Value::radec("TEL", "telescope position", 0.0, 0.0);
    copy.set(&value.serialize()).unwrap();
    assert!(copy.is_equal(&value));

    let ValueData::Scalar(Scalar::RaDec { ra, dec }) = value.data() else {
        panic!("Expected a radec value");
    };
    assert!((ra - 20.0).abs() < 1e-9);
    assert!((dec + 10.5).abs() < 1e-9);
}

#[test]
fn test_radec_delta_shifts_both_axes() {
    let mut value = Value::radec("OFFS", "offsets", 10.0, 20.0);
    value.apply_text(DeltaOp::Add, "1 2").unwrap();
    assert!(value.is_equal(&Value::radec("OFFS", "", 11.0, 22.0)));
}

#[test]
fn test_integer_deltas() {
    let mut value = Value::integer("FOC_POS", "position", 100);
    value.apply_text(DeltaOp::Add, "25").unwrap();
    assert_eq!(value.as_i64(), Some(125));
    value.apply_text(DeltaOp::Subtract, "200").unwrap();
    assert_eq!(value.as_i64(), Some(-75));

    let mut limit = Value::integer("LIMIT", "", i32::MAX);
    assert!(limit.apply_text(DeltaOp::Add, "1").is_err());
    assert_eq!(limit.as_i64(), Some(i64::from(i32::MAX)));
}

#[test]
fn test_string_and_bool_reject_arithmetic() {
    let mut name = Value::string("OBJECT", "", "M31");
    assert!(matches!(
        name.apply_text(DeltaOp::Add, "x"),
        Err(OpError::Unsupported { .. })
    ));
    let mut flag = Value::boolean("COOLING", "", true);
    assert!(flag.apply_text(DeltaOp::Subtract, "on").is_err());
}

#[test]
fn test_selection_by_symbol_and_index() {
    let mut filter = Value::selection("FILTER", "filter wheel", &["U", "B", "V", "R", "I"]);
    filter.set("V").unwrap();
    assert_eq!(filter.as_i64(), Some(2));
    assert_eq!(filter.serialize(), "V");

    filter.set("4").unwrap();
    assert_eq!(filter.as_str(), Some("I"));

    assert!(filter.set("Z").is_err());
    assert!(filter.set("5").is_err());
    assert_eq!(filter.as_str(), Some("I"));
}

#[test]
fn test_selection_cycles_with_modulo() {
    let mut filter = Value::selection("FILTER", "filter wheel", &["U", "B", "V"]);
    filter.set("V").unwrap();
    filter.apply_text(DeltaOp::Add, "1").unwrap();
    assert_eq!(filter.as_str(), Some("U"));

    filter.apply_text(DeltaOp::Subtract, "1").unwrap();
    assert_eq!(filter.as_str(), Some("V"));

    filter.apply_text(DeltaOp::Add, "5").unwrap();
    assert_eq!(filter.as_i64(), Some(1));
}

#[test]
fn test_selection_negative_add_stays_negative() {
    let mut filter = Value::selection("FILTER", "filter wheel", &["U", "B", "V"]);
    filter.apply_text(DeltaOp::Add, "-1").unwrap();
    assert_eq!(filter.as_i64(), Some(-1));
    assert_eq!(filter.as_str(), None);
    assert_eq!(filter.serialize(), "-1");
}

#[test]
fn test_empty_selection_rejects_shift() {
    let mut empty = Value::new("EMPTY", "", ValueType::Selection);
    assert_eq!(
        empty.apply_text(DeltaOp::Add, "1"),
        Err(OpError::EmptySelection)
    );
}

#[test]
fn test_selection_metainfo_lists_symbols() {
    let filter = Value::selection("FILTER", "filter wheel", &["U", "B"]).writable();
    let lines: Vec<String> = filter.meta_records().iter().map(|r| r.to_line()).collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("METAINFO "));
    assert_eq!(lines[1], "SELMETAINFO \"FILTER\" \"U\"");
    assert_eq!(lines[2], "SELMETAINFO \"FILTER\" \"B\"");
}

#[test]
fn test_min_max_bounds() {
    let mut temp = Value::min_max("CCD_SET", "cooling target", -20.0, -50.0, 10.0);
    temp.set("-30").unwrap();
    assert_eq!(temp.as_f64(), Some(-30.0));

    assert!(temp.set("20").is_err());
    assert_eq!(temp.as_f64(), Some(-30.0));

    // A full triple replaces the range as well
    temp.set("40 0 50").unwrap();
    let range = temp.as_min_max().unwrap();
    assert_eq!((range.value, range.min, range.max), (40.0, 0.0, 50.0));

    assert!(temp.apply_text(DeltaOp::Add, "20").is_err());
    temp.apply_text(DeltaOp::Subtract, "15").unwrap();
    assert_eq!(temp.as_f64(), Some(25.0));
}

#[test]
fn test_rectangle_assignment_is_atomic() {
    let mut window = Value::rectangle("WIN", "readout window", BaseType::Integer).writable();
    window.set("0 0 1024 2048").unwrap();
    let rect = window.as_rectangle().unwrap();
    assert_eq!(rect.width().as_i64(), Some(1024));
    assert_eq!(rect.height().name(), "WIN.HEIGHT");

    // Fourth part is bad, so nothing may change
    assert!(window.set("10 10 512 tall").is_err());
    assert!(window.set("10 10 512").is_err());
    let rect = window.as_rectangle().unwrap();
    assert_eq!(rect.x().as_i64(), Some(0));
    assert_eq!(rect.height().as_i64(), Some(2048));
    assert_eq!(window.serialize(), "0 0 1024 2048");
}

#[test]
fn test_rectangle_children_inherit_writable() {
    let window = Value::rectangle("WIN", "readout window", BaseType::Integer).writable();
    let rect = window.as_rectangle().unwrap();
    assert!(rect.children().iter().all(|child| child.is_writable()));
}

#[test]
fn test_array_set_and_index() {
    let mut temps = Value::array("TEMPS", "sensor temperatures", BaseType::Double);
    temps.set("1.5 2.5 3.5").unwrap();
    assert_eq!(temps.as_array().unwrap().len(), 3);

    temps.set_values(&[0, 2], "9").unwrap();
    let items = temps.as_array().unwrap();
    assert_eq!(items.get(0).and_then(|s| s.as_f64()), Some(9.0));
    assert_eq!(items.get(1).and_then(|s| s.as_f64()), Some(2.5));
    assert_eq!(items.get(2).and_then(|s| s.as_f64()), Some(9.0));

    assert!(matches!(
        temps.set_values(&[1, 3], "0"),
        Err(OpError::IndexOutOfBounds { index: 3, len: 3 })
    ));
    assert_eq!(temps.as_array().unwrap().get(1).and_then(|s| s.as_f64()), Some(2.5));

    temps.set("").unwrap();
    assert!(temps.as_array().unwrap().is_empty());
    assert_eq!(temps.serialize(), "");
}

#[test]
fn test_array_rejects_arithmetic() {
    let mut temps = Value::array("TEMPS", "", BaseType::Integer);
    temps.set("1 2").unwrap();
    assert!(temps.apply_text(DeltaOp::Add, "1 1").is_err());
}

#[test]
fn test_cross_kind_equality() {
    let filter = {
        let mut v = Value::selection("FILTER", "", &["U", "B", "V"]);
        v.set("B").unwrap();
        v
    };
    assert!(filter.is_equal(&Value::integer("N", "", 1)));
    assert!(Value::integer("A", "", 3).is_equal(&Value::double("B", "", 3.0)));
    assert!(!Value::string("A", "", "3").is_equal(&Value::integer("B", "", 3)));
}

#[test]
fn test_flags_in_type_code() {
    let value = Value::double("RA", "right ascension", 0.0).with_flags(ValueFlags {
        writable: true,
        fits: true,
        display: DisplayHint::RightAscension,
    });
    let code = value.type_code();
    assert_eq!(ValueType::from_code(code).unwrap(), ValueType::Scalar(BaseType::Double));
    assert_eq!(ValueFlags::from_bits(code), value.flags());
}

#[test]
fn test_unknown_type_code_rejected() {
    assert!(ValueType::from_code(0x0000_0099).is_err());
    assert!(ValueType::from_code(0x0000_0409).is_err());
    assert_eq!(
        ValueType::from_code(0x0000_0402).unwrap(),
        ValueType::Array(BaseType::Integer)
    );
}

#[test]
fn test_value_set_dirty_tracking() {
    let mut values = ValueSet::new();
    values.create(Value::integer("FOC_POS", "position", 0)).unwrap();
    values.create(Value::double("FOC_TAR", "target", 0.0).writable()).unwrap();
    assert!(matches!(
        values.create(Value::integer("FOC_POS", "again", 1)),
        Err(OpError::Duplicate(_))
    ));

    values.clear_dirty();
    assert!(!values.has_dirty());

    values.set("FOC_TAR", "150").unwrap();
    let dirty: Vec<&str> = values.dirty().map(|v| v.name()).collect();
    assert_eq!(dirty, vec!["FOC_TAR"]);

    assert!(matches!(values.set("MISSING", "1"), Err(OpError::UnknownValue(_))));
}

#[test]
fn test_mirror_follows_announced_type() {
    let source = Value::min_max("CCD_SET", "cooling target", -20.0, -50.0, 10.0).writable();
    let mirror = Mirror::announce(source.type_code(), "CCD_SET", "cooling target").unwrap();
    assert!(mirror.is_writable());
    assert_eq!(mirror.value_type(), ValueType::MinMax);
    assert!(mirror.as_f64().unwrap().is_nan());

    let mut copy = mirror.value().clone();
    copy.set(&source.serialize()).unwrap();
    assert!(copy.is_equal(&source));
}
