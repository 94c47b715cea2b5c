//! Typed, named, change-tracked state cells.
//!
//! A [`Value`] is one closed sum over the primitive kinds ([`Scalar`]), the enumerated
//! [`Selection`], the range-checked [`MinMax`] and the composites [`Rectangle`] and
//! [`ValueArray`]. Parsing, serialization and deltas all dispatch through the same match,
//! and the kind is fixed at construction: every mutator parses into the existing variant.

pub mod composite;
pub mod registry;
pub mod scalar;

pub use composite::{MinMax, Rectangle, Selection, ValueArray};
pub use registry::{Mirror, ValueSet};
pub use scalar::{display_double, BaseType, Scalar, TYPE_SELECTION};

use crate::error::{OpError, ParseError};
use crate::protocol::{Params, Record};
use core::fmt;

pub const TYPE_MASK: u32 = 0x0000_00ff;
pub const EXT_MASK: u32 = 0x0000_0f00;
pub const EXT_MINMAX: u32 = 0x0000_0100;
pub const EXT_RECTANGLE: u32 = 0x0000_0200;
pub const EXT_ARRAY: u32 = 0x0000_0400;

pub const DISPLAY_MASK: u32 = 0x00ff_0000;
pub const FLAG_FITS: u32 = 0x0100_0000;
pub const FLAG_WRITABLE: u32 = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Scalar(BaseType),
    Selection,
    MinMax,
    Rectangle(BaseType),
    Array(BaseType),
}

impl ValueType {
    pub fn code(self) -> u32 {
        match self {
            ValueType::Scalar(base) => base.code(),
            ValueType::Selection => TYPE_SELECTION,
            ValueType::MinMax => EXT_MINMAX | BaseType::Double.code(),
            ValueType::Rectangle(base) => EXT_RECTANGLE | base.code(),
            ValueType::Array(base) => EXT_ARRAY | base.code(),
        }
    }

    /// Decode the type part of a metainfo type word; flag bits are ignored.
    pub fn from_code(code: u32) -> Result<Self, ParseError> {
        let base_code = code & TYPE_MASK;
        let unknown = || ParseError::UnknownType(code & (TYPE_MASK | EXT_MASK));
        let base = BaseType::from_code(base_code);

        match code & EXT_MASK {
            0 if base_code == TYPE_SELECTION => Ok(ValueType::Selection),
            0 => base.map(ValueType::Scalar).ok_or_else(unknown),
            EXT_MINMAX if base == Some(BaseType::Double) => Ok(ValueType::MinMax),
            EXT_RECTANGLE => match base {
                Some(b @ (BaseType::Integer | BaseType::Double)) => Ok(ValueType::Rectangle(b)),
                _ => Err(unknown()),
            },
            EXT_ARRAY => match base {
                Some(b) if b.is_single_token() => Ok(ValueType::Array(b)),
                _ => Err(unknown()),
            },
            _ => Err(unknown()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Scalar(base) => base.name(),
            ValueType::Selection => "selection",
            ValueType::MinMax => "minmax",
            ValueType::Rectangle(_) => "rectangle",
            ValueType::Array(_) => "array",
        }
    }
}

/// How front ends should render a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisplayHint {
    #[default]
    Plain,
    RightAscension,
    Declination,
    Degrees,
    DegreeDistance,
    Percent,
    Hex,
    ByteSize,
    Interval,
}

impl DisplayHint {
    const ALL: [DisplayHint; 9] = [
        DisplayHint::Plain,
        DisplayHint::RightAscension,
        DisplayHint::Declination,
        DisplayHint::Degrees,
        DisplayHint::DegreeDistance,
        DisplayHint::Percent,
        DisplayHint::Hex,
        DisplayHint::ByteSize,
        DisplayHint::Interval,
    ];

    fn bits(self) -> u32 {
        let index = Self::ALL.iter().position(|&h| h == self).unwrap_or(0);
        (index as u32) << 16
    }

    fn from_bits(bits: u32) -> Self {
        let index = ((bits & DISPLAY_MASK) >> 16) as usize;
        Self::ALL.get(index).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueFlags {
    /// Peers may change the value with a set request.
    pub writable: bool,
    /// Recorded in image headers.
    pub fits: bool,
    pub display: DisplayHint,
}

impl ValueFlags {
    pub fn bits(self) -> u32 {
        let mut bits = self.display.bits();
        if self.writable {
            bits |= FLAG_WRITABLE;
        }
        if self.fits {
            bits |= FLAG_FITS;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            writable: bits & FLAG_WRITABLE != 0,
            fits: bits & FLAG_FITS != 0,
            display: DisplayHint::from_bits(bits),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Set,
    Add,
    Subtract,
}

impl DeltaOp {
    pub fn parse(token: &str) -> Result<Self, ParseError> {
        match token {
            "=" => Ok(DeltaOp::Set),
            "+" | "+=" => Ok(DeltaOp::Add),
            "-" | "-=" => Ok(DeltaOp::Subtract),
            _ => Err(ParseError::InvalidOperator(token.to_string())),
        }
    }

    pub fn symbol(self) -> char {
        match self {
            DeltaOp::Set => '=',
            DeltaOp::Add => '+',
            DeltaOp::Subtract => '-',
        }
    }
}

impl fmt::Display for DeltaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

#[derive(Debug, Clone)]
pub enum ValueData {
    Scalar(Scalar),
    Selection(Selection),
    MinMax(MinMax),
    Rectangle(Box<Rectangle>),
    Array(ValueArray),
}

#[derive(Debug, Clone)]
pub struct Value {
    name: String,
    description: String,
    flags: ValueFlags,
    dirty: bool,
    data: ValueData,
}

impl Value {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        value_type: ValueType,
    ) -> Self {
        let name = name.into();
        let description = description.into();
        let data = match value_type {
            ValueType::Scalar(base) => ValueData::Scalar(Scalar::default_of(base)),
            ValueType::Selection => ValueData::Selection(Selection::default()),
            ValueType::MinMax => {
                ValueData::MinMax(MinMax::new(f64::NAN, f64::NEG_INFINITY, f64::INFINITY))
            }
            ValueType::Rectangle(base) => {
                ValueData::Rectangle(Box::new(Rectangle::new(&name, &description, base)))
            }
            ValueType::Array(base) => ValueData::Array(ValueArray::new(base)),
        };
        Self::from_data(name, description, data)
    }

    pub(crate) fn from_data(name: String, description: String, data: ValueData) -> Self {
        Self {
            name,
            description,
            flags: ValueFlags::default(),
            dirty: false,
            data,
        }
    }

    fn anonymous(scalar: Scalar) -> Self {
        Self::from_data(String::new(), String::new(), ValueData::Scalar(scalar))
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>, value: &str) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::String(value.to_string())),
        )
    }

    pub fn integer(name: impl Into<String>, description: impl Into<String>, value: i32) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::Integer(value)),
        )
    }

    pub fn long(name: impl Into<String>, description: impl Into<String>, value: i64) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::Long(value)),
        )
    }

    pub fn double(name: impl Into<String>, description: impl Into<String>, value: f64) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::Double(value)),
        )
    }

    pub fn float(name: impl Into<String>, description: impl Into<String>, value: f32) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::Float(value)),
        )
    }

    pub fn time(name: impl Into<String>, description: impl Into<String>, seconds: f64) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::Time(seconds)),
        )
    }

    pub fn boolean(name: impl Into<String>, description: impl Into<String>, value: bool) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::Bool(value)),
        )
    }

    pub fn radec(
        name: impl Into<String>,
        description: impl Into<String>,
        ra: f64,
        dec: f64,
    ) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::RaDec { ra, dec }),
        )
    }

    pub fn altaz(
        name: impl Into<String>,
        description: impl Into<String>,
        alt: f64,
        az: f64,
    ) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Scalar(Scalar::AltAz { alt, az }),
        )
    }

    pub fn selection<S: AsRef<str>>(
        name: impl Into<String>,
        description: impl Into<String>,
        symbols: &[S],
    ) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::Selection(Selection::new(symbols)),
        )
    }

    pub fn min_max(
        name: impl Into<String>,
        description: impl Into<String>,
        value: f64,
        min: f64,
        max: f64,
    ) -> Self {
        Self::from_data(
            name.into(),
            description.into(),
            ValueData::MinMax(MinMax::new(value, min, max)),
        )
    }

    pub fn rectangle(
        name: impl Into<String>,
        description: impl Into<String>,
        base: BaseType,
    ) -> Self {
        Self::new(name, description, ValueType::Rectangle(base))
    }

    pub fn array(name: impl Into<String>, description: impl Into<String>, base: BaseType) -> Self {
        Self::new(name, description, ValueType::Array(base))
    }

    pub fn with_flags(mut self, flags: ValueFlags) -> Self {
        self.flags = flags;
        if let ValueData::Rectangle(rect) = &mut self.data {
            rect.set_flags(flags);
        }
        self
    }

    /// Let peers change the value with set requests.
    pub fn writable(self) -> Self {
        let flags = ValueFlags {
            writable: true,
            ..self.flags
        };
        self.with_flags(flags)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn flags(&self) -> ValueFlags {
        self.flags
    }

    pub fn is_writable(&self) -> bool {
        self.flags.writable
    }

    pub fn value_type(&self) -> ValueType {
        match &self.data {
            ValueData::Scalar(scalar) => ValueType::Scalar(scalar.base_type()),
            ValueData::Selection(_) => ValueType::Selection,
            ValueData::MinMax(_) => ValueType::MinMax,
            ValueData::Rectangle(rect) => ValueType::Rectangle(rect.base_type()),
            ValueData::Array(array) => ValueType::Array(array.base()),
        }
    }

    /// Type word announced in metainfo: kind plus flag bits.
    pub fn type_code(&self) -> u32 {
        self.value_type().code() | self.flags.bits()
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn as_f64(&self) -> Option<f64> {
        match &self.data {
            ValueData::Scalar(scalar) => scalar.as_f64(),
            ValueData::Selection(sel) => Some(f64::from(sel.index())),
            ValueData::MinMax(mm) => Some(mm.value),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match &self.data {
            ValueData::Scalar(scalar) => scalar.as_i64(),
            ValueData::Selection(sel) => Some(i64::from(sel.index())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &self.data {
            ValueData::Scalar(Scalar::Bool(flag)) => Some(*flag),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            ValueData::Scalar(Scalar::String(text)) => Some(text),
            ValueData::Selection(sel) => sel.selected(),
            _ => None,
        }
    }

    pub fn as_selection(&self) -> Option<&Selection> {
        match &self.data {
            ValueData::Selection(sel) => Some(sel),
            _ => None,
        }
    }

    pub fn as_min_max(&self) -> Option<&MinMax> {
        match &self.data {
            ValueData::MinMax(mm) => Some(mm),
            _ => None,
        }
    }

    pub fn as_rectangle(&self) -> Option<&Rectangle> {
        match &self.data {
            ValueData::Rectangle(rect) => Some(rect),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ValueArray> {
        match &self.data {
            ValueData::Array(array) => Some(array),
            _ => None,
        }
    }

    /// Parse `text` with the grammar of this value's kind. Composite kinds either take
    /// every part or change nothing.
    pub fn set(&mut self, text: &str) -> Result<(), ParseError> {
        let mut params = Params::new(text);
        match &mut self.data {
            ValueData::Scalar(Scalar::String(current)) => {
                // Unquoted text is taken whole.
                *current = if text.trim_start().starts_with('"') {
                    let parsed = params.next_string()?;
                    params.end()?;
                    parsed
                } else {
                    text.trim().to_string()
                };
            }
            ValueData::Scalar(scalar) => {
                let parsed = Scalar::parse(scalar.base_type(), &mut params)?;
                params.end()?;
                *scalar = parsed;
            }
            ValueData::Selection(sel) => {
                let token = params.next_string()?;
                params.end()?;
                let index = sel.parse_index(&token)?;
                sel.set_index(index);
            }
            ValueData::MinMax(mm) => {
                let parsed = mm.parse(&mut params)?;
                params.end()?;
                *mm = parsed;
            }
            ValueData::Rectangle(rect) => {
                let parts = rect.parse(&mut params)?;
                params.end()?;
                rect.assign(parts);
            }
            ValueData::Array(array) => {
                let items = array.parse(&mut params)?;
                array.replace(items);
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// `self = self <op> other`.
    pub fn apply_delta(&mut self, op: DeltaOp, other: &Value) -> Result<(), OpError> {
        let target = self.value_type().name();
        let operand = other.value_type().name();
        let incompatible = || OpError::Incompatible { target, operand };

        match (&mut self.data, &other.data) {
            (ValueData::Scalar(scalar), ValueData::Scalar(o)) => scalar.apply(op, o)?,
            (ValueData::Scalar(scalar), ValueData::Selection(o)) => {
                scalar.apply(op, &Scalar::Integer(o.index()))?;
            }
            (ValueData::Scalar(scalar), ValueData::MinMax(o)) => {
                scalar.apply(op, &Scalar::Double(o.value))?;
            }
            (ValueData::Selection(sel), ValueData::Selection(o)) => sel.shift(op, o.index())?,
            (ValueData::Selection(sel), ValueData::Scalar(o)) => {
                let step = o
                    .as_i64()
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(incompatible)?;
                sel.shift(op, step)?;
            }
            (ValueData::MinMax(mm), ValueData::MinMax(o)) => {
                if op == DeltaOp::Set {
                    *mm = *o;
                } else {
                    mm.apply(op, o.value)?;
                }
            }
            (ValueData::MinMax(mm), ValueData::Scalar(o)) => {
                mm.apply(op, o.as_f64().ok_or_else(incompatible)?)?;
            }
            (ValueData::Rectangle(rect), ValueData::Rectangle(o)) => rect.apply(op, o)?,
            (ValueData::Array(array), ValueData::Array(o)) => array.apply(op, o)?,
            _ => return Err(incompatible()),
        }
        self.dirty = true;
        Ok(())
    }

    /// Apply a delta written as text, as carried by a set request.
    pub fn apply_text(&mut self, op: DeltaOp, text: &str) -> Result<(), OpError> {
        if op == DeltaOp::Set {
            self.set(text)?;
            return Ok(());
        }
        let mut operand = match &self.data {
            ValueData::Selection(_) => Value::anonymous(Scalar::Integer(0)),
            ValueData::MinMax(_) => Value::anonymous(Scalar::Double(0.0)),
            _ => self.clone(),
        };
        operand.set(text)?;
        self.apply_delta(op, &operand)
    }

    pub fn set_from(&mut self, other: &Value) -> Result<(), OpError> {
        self.apply_delta(DeltaOp::Set, other)
    }

    pub fn set_double(&mut self, value: f64) -> Result<(), OpError> {
        self.set_from(&Value::anonymous(Scalar::Double(value)))
    }

    pub fn set_integer(&mut self, value: i32) -> Result<(), OpError> {
        self.set_from(&Value::anonymous(Scalar::Integer(value)))
    }

    pub fn set_long(&mut self, value: i64) -> Result<(), OpError> {
        self.set_from(&Value::anonymous(Scalar::Long(value)))
    }

    pub fn set_bool(&mut self, value: bool) -> Result<(), OpError> {
        self.set_from(&Value::anonymous(Scalar::Bool(value)))
    }

    pub fn set_string(&mut self, value: &str) -> Result<(), OpError> {
        self.set_from(&Value::anonymous(Scalar::String(value.to_string())))
    }

    pub fn set_selection(&mut self, symbol: &str) -> Result<(), OpError> {
        let ValueData::Selection(sel) = &mut self.data else {
            return Err(OpError::Unsupported {
                op: '=',
                kind: "symbol assignment on non-selection",
            });
        };
        let index = sel.parse_index(symbol)?;
        sel.set_index(index);
        self.dirty = true;
        Ok(())
    }

    /// Assign one parsed element at each of `indices` of an array value.
    pub fn set_values(&mut self, indices: &[usize], text: &str) -> Result<(), OpError> {
        let ValueData::Array(array) = &mut self.data else {
            return Err(OpError::Unsupported {
                op: '=',
                kind: "indexed assignment on non-array",
            });
        };
        let mut params = Params::new(text);
        let item = Scalar::parse(array.base(), &mut params)?;
        params.end()?;
        array.set_at(indices, &item)?;
        self.dirty = true;
        Ok(())
    }

    pub fn push(&mut self, item: Scalar) -> Result<(), OpError> {
        let ValueData::Array(array) = &mut self.data else {
            return Err(OpError::Unsupported {
                op: '+',
                kind: "push on non-array",
            });
        };
        array.push(item)?;
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn add_symbol(&mut self, symbol: &str) -> bool {
        match &mut self.data {
            ValueData::Selection(sel) => {
                sel.add_symbol(symbol);
                true
            }
            _ => false,
        }
    }

    /// Canonical wire text; `set(serialize())` reproduces the value.
    pub fn serialize(&self) -> String {
        match &self.data {
            ValueData::Scalar(scalar) => scalar.render(),
            ValueData::Selection(sel) => sel.render(),
            ValueData::MinMax(mm) => mm.render(),
            ValueData::Rectangle(rect) => rect.render(),
            ValueData::Array(array) => array.render(),
        }
    }

    pub fn display_value(&self) -> String {
        match &self.data {
            ValueData::Scalar(scalar) => scalar.display(),
            ValueData::Selection(sel) => sel
                .selected()
                .map_or_else(|| sel.index().to_string(), str::to_string),
            ValueData::MinMax(mm) => display_double(mm.value),
            ValueData::Rectangle(rect) => rect.display(),
            ValueData::Array(array) => array.display(),
        }
    }

    /// Compare data only. Values of unrelated kinds are simply not equal.
    pub fn is_equal(&self, other: &Value) -> bool {
        match (&self.data, &other.data) {
            (ValueData::Scalar(a), ValueData::Scalar(b)) => {
                a == b || matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
            }
            (ValueData::Selection(a), ValueData::Selection(b)) => a.index() == b.index(),
            (ValueData::Selection(a), ValueData::Scalar(b))
            | (ValueData::Scalar(b), ValueData::Selection(a)) => {
                b.as_i64() == Some(i64::from(a.index()))
            }
            (ValueData::MinMax(a), ValueData::MinMax(b)) => a == b,
            (ValueData::MinMax(a), ValueData::Scalar(b))
            | (ValueData::Scalar(b), ValueData::MinMax(a)) => b.as_f64() == Some(a.value),
            (ValueData::Rectangle(a), ValueData::Rectangle(b)) => a
                .children()
                .iter()
                .zip(b.children())
                .all(|(x, y)| x.is_equal(y)),
            (ValueData::Array(a), ValueData::Array(b)) => a == b,
            _ => false,
        }
    }

    /// Self-describing header sent before a value is first exposed to a peer.
    pub fn meta_records(&self) -> Vec<Record> {
        let mut records = vec![Record::MetaInfo {
            type_code: self.type_code(),
            name: self.name.clone(),
            description: self.description.clone(),
        }];
        if let ValueData::Selection(sel) = &self.data {
            records.extend(sel.symbols().iter().map(|symbol| Record::SelMetaInfo {
                name: self.name.clone(),
                symbol: symbol.clone(),
            }));
        }
        records
    }

    pub fn value_record(&self) -> Record {
        Record::Value {
            name: self.name.clone(),
            text: self.serialize(),
        }
    }
}
