use super::scalar::{combine, BaseType, Scalar};
use super::{DeltaOp, Value, ValueData, ValueFlags};
use crate::error::{OpError, ParseError};
use crate::protocol::{format_double, quote_if_needed, Params};

/// Enumerated value: an index into an ordered symbol table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    index: i32,
    symbols: Vec<String>,
}

impl Selection {
    pub fn new<S: AsRef<str>>(symbols: &[S]) -> Self {
        Self {
            index: 0,
            symbols: symbols.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    pub fn index(&self) -> i32 {
        self.index
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbol at the current index, if the index is in range.
    pub fn selected(&self) -> Option<&str> {
        usize::try_from(self.index)
            .ok()
            .and_then(|i| self.symbols.get(i))
            .map(String::as_str)
    }

    pub fn position(&self, symbol: &str) -> Option<i32> {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .and_then(|i| i32::try_from(i).ok())
    }

    pub(crate) fn add_symbol(&mut self, symbol: &str) {
        self.symbols.push(symbol.to_string());
    }

    fn size(&self) -> i32 {
        i32::try_from(self.symbols.len()).unwrap_or(i32::MAX)
    }

    /// Index named by `token`: a registered symbol, or failing that a number.
    pub(crate) fn parse_index(&self, token: &str) -> Result<i32, ParseError> {
        if let Some(index) = self.position(token) {
            return Ok(index);
        }
        if let Ok(index) = token.parse::<i32>() {
            if self.symbols.is_empty() || (0..self.size()).contains(&index) {
                return Ok(index);
            }
        }
        Err(ParseError::UnknownSymbol(token.to_string()))
    }

    pub(crate) fn set_index(&mut self, index: i32) {
        self.index = index;
    }

    /// Cyclic shift. `+` is a plain remainder, so a negative step may leave a negative
    /// index; `-` folds negative results back into range.
    pub(crate) fn shift(&mut self, op: DeltaOp, step: i32) -> Result<(), OpError> {
        let size = self.size();
        if op == DeltaOp::Set {
            if size > 0 && !(0..size).contains(&step) {
                return Err(OpError::OutOfRange(f64::from(step)));
            }
            self.index = step;
            return Ok(());
        }
        if size == 0 {
            return Err(OpError::EmptySelection);
        }

        let overflow = || OpError::OutOfRange(f64::from(step));
        self.index = match op {
            DeltaOp::Add => self.index.checked_add(step).ok_or_else(overflow)? % size,
            _ => {
                let shifted = self.index.checked_sub(step).ok_or_else(overflow)?;
                if shifted < 0 {
                    shifted.rem_euclid(size)
                } else {
                    shifted
                }
            }
        };
        Ok(())
    }

    pub(crate) fn render(&self) -> String {
        match self.selected() {
            Some(symbol) => quote_if_needed(symbol),
            None => self.index.to_string(),
        }
    }
}

/// Double bounded by an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinMax {
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl MinMax {
    pub fn new(value: f64, min: f64, max: f64) -> Self {
        Self { value, min, max }
    }

    /// NaN is never out of range.
    pub fn contains(&self, value: f64) -> bool {
        value.is_nan() || (value >= self.min && value <= self.max)
    }

    /// `value` checked against the current range, or `value min max` replacing it.
    pub(crate) fn parse(&self, params: &mut Params<'_>) -> Result<Self, ParseError> {
        let value = params.next_double()?;
        let parsed = if params.is_empty() {
            Self { value, ..*self }
        } else {
            let min = params.next_double()?;
            let max = params.next_double()?;
            Self { value, min, max }
        };
        if !parsed.contains(value) {
            return Err(ParseError::OutOfRange {
                value,
                min: parsed.min,
                max: parsed.max,
            });
        }
        Ok(parsed)
    }

    pub(crate) fn apply(&mut self, op: DeltaOp, operand: f64) -> Result<(), OpError> {
        let value = combine(self.value, op, operand);
        if !self.contains(value) {
            return Err(OpError::OutOfRange(value));
        }
        self.value = value;
        Ok(())
    }

    pub(crate) fn render(&self) -> String {
        format!(
            "{} {} {}",
            format_double(self.value),
            format_double(self.min),
            format_double(self.max)
        )
    }
}

/// Four child values `NAME.X`, `NAME.Y`, `NAME.WIDTH`, `NAME.HEIGHT`.
#[derive(Debug, Clone)]
pub struct Rectangle {
    x: Value,
    y: Value,
    width: Value,
    height: Value,
}

impl Rectangle {
    pub(crate) fn new(name: &str, description: &str, base: BaseType) -> Self {
        let child = |suffix: &str| {
            Value::from_data(
                format!("{name}.{suffix}"),
                format!("{description} {suffix}"),
                ValueData::Scalar(Scalar::default_of(base)),
            )
        };
        Self {
            x: child("X"),
            y: child("Y"),
            width: child("WIDTH"),
            height: child("HEIGHT"),
        }
    }

    pub fn x(&self) -> &Value {
        &self.x
    }

    pub fn y(&self) -> &Value {
        &self.y
    }

    pub fn width(&self) -> &Value {
        &self.width
    }

    pub fn height(&self) -> &Value {
        &self.height
    }

    pub fn children(&self) -> [&Value; 4] {
        [&self.x, &self.y, &self.width, &self.height]
    }

    fn children_mut(&mut self) -> [&mut Value; 4] {
        [&mut self.x, &mut self.y, &mut self.width, &mut self.height]
    }

    pub fn base_type(&self) -> BaseType {
        match &self.x.data {
            ValueData::Scalar(scalar) => scalar.base_type(),
            _ => BaseType::Integer,
        }
    }

    pub(crate) fn set_flags(&mut self, flags: ValueFlags) {
        for child in self.children_mut() {
            child.flags = flags;
        }
    }

    /// Parse all four parts before touching any child.
    pub(crate) fn parse(&self, params: &mut Params<'_>) -> Result<[Scalar; 4], ParseError> {
        let base = self.base_type();
        Ok([
            Scalar::parse(base, params)?,
            Scalar::parse(base, params)?,
            Scalar::parse(base, params)?,
            Scalar::parse(base, params)?,
        ])
    }

    pub(crate) fn assign(&mut self, parts: [Scalar; 4]) {
        for (child, part) in self.children_mut().into_iter().zip(parts) {
            child.data = ValueData::Scalar(part);
            child.dirty = true;
        }
    }

    pub(crate) fn apply(&mut self, op: DeltaOp, other: &Rectangle) -> Result<(), OpError> {
        let mut updated = self.clone();
        for (child, operand) in updated.children_mut().into_iter().zip(other.children()) {
            child.apply_delta(op, operand)?;
        }
        *self = updated;
        Ok(())
    }

    pub(crate) fn render(&self) -> String {
        self.children()
            .iter()
            .map(|child| child.serialize())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn display(&self) -> String {
        self.children()
            .iter()
            .map(|child| child.display_value())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Ordered homogeneous sequence of scalars.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueArray {
    base: BaseType,
    items: Vec<Scalar>,
}

impl ValueArray {
    pub fn new(base: BaseType) -> Self {
        Self {
            base,
            items: Vec::new(),
        }
    }

    pub fn base(&self) -> BaseType {
        self.base
    }

    pub fn items(&self) -> &[Scalar] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.items.get(index)
    }

    /// Every remaining token, each as one element.
    pub(crate) fn parse(&self, params: &mut Params<'_>) -> Result<Vec<Scalar>, ParseError> {
        let mut items = Vec::new();
        while !params.is_empty() {
            items.push(Scalar::parse(self.base, params)?);
        }
        Ok(items)
    }

    pub(crate) fn replace(&mut self, items: Vec<Scalar>) {
        self.items = items;
    }

    pub(crate) fn push(&mut self, item: Scalar) -> Result<(), OpError> {
        if item.base_type() != self.base {
            return Err(OpError::Incompatible {
                target: self.base.name(),
                operand: item.base_type().name(),
            });
        }
        self.items.push(item);
        Ok(())
    }

    /// Assign `item` at every index in `indices`; nothing changes if any index is invalid.
    pub(crate) fn set_at(&mut self, indices: &[usize], item: &Scalar) -> Result<(), OpError> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.items.len()) {
            return Err(OpError::IndexOutOfBounds {
                index,
                len: self.items.len(),
            });
        }
        for &index in indices {
            self.items[index] = item.clone();
        }
        Ok(())
    }

    pub(crate) fn apply(&mut self, op: DeltaOp, other: &ValueArray) -> Result<(), OpError> {
        if op != DeltaOp::Set {
            return Err(OpError::Unsupported {
                op: op.symbol(),
                kind: "array",
            });
        }
        if other.base != self.base {
            return Err(OpError::Incompatible {
                target: self.base.name(),
                operand: other.base.name(),
            });
        }
        self.items.clone_from(&other.items);
        Ok(())
    }

    pub(crate) fn render(&self) -> String {
        self.items
            .iter()
            .map(Scalar::render)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub(crate) fn display(&self) -> String {
        self.items
            .iter()
            .map(Scalar::display)
            .collect::<Vec<_>>()
            .join(" ")
    }
}
