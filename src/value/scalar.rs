use super::DeltaOp;
use crate::error::{OpError, ParseError};
use crate::protocol::{format_double, parse_double, quote, Params};

pub const TYPE_SELECTION: u32 = 7;

/// Primitive kinds a scalar cell can hold. Selection lives outside this set because it
/// carries its own symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    String,
    Integer,
    Time,
    Double,
    Float,
    Bool,
    Long,
    RaDec,
    AltAz,
}

impl BaseType {
    pub fn code(self) -> u32 {
        match self {
            BaseType::String => 1,
            BaseType::Integer => 2,
            BaseType::Time => 3,
            BaseType::Double => 4,
            BaseType::Float => 5,
            BaseType::Bool => 6,
            BaseType::Long => 8,
            BaseType::RaDec => 9,
            BaseType::AltAz => 10,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            1 => BaseType::String,
            2 => BaseType::Integer,
            3 => BaseType::Time,
            4 => BaseType::Double,
            5 => BaseType::Float,
            6 => BaseType::Bool,
            8 => BaseType::Long,
            9 => BaseType::RaDec,
            10 => BaseType::AltAz,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            BaseType::String => "string",
            BaseType::Integer => "integer",
            BaseType::Time => "time",
            BaseType::Double => "double",
            BaseType::Float => "float",
            BaseType::Bool => "bool",
            BaseType::Long => "long",
            BaseType::RaDec => "radec",
            BaseType::AltAz => "altaz",
        }
    }

    /// Kinds that serialize to exactly one token and may therefore live in arrays.
    pub fn is_single_token(self) -> bool {
        !matches!(self, BaseType::RaDec | BaseType::AltAz)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    String(String),
    Integer(i32),
    Time(f64),
    Double(f64),
    Float(f32),
    Bool(bool),
    Long(i64),
    RaDec { ra: f64, dec: f64 },
    AltAz { alt: f64, az: f64 },
}

impl Scalar {
    pub fn default_of(base: BaseType) -> Self {
        match base {
            BaseType::String => Scalar::String(String::new()),
            BaseType::Integer => Scalar::Integer(0),
            BaseType::Time => Scalar::Time(f64::NAN),
            BaseType::Double => Scalar::Double(f64::NAN),
            BaseType::Float => Scalar::Float(f32::NAN),
            BaseType::Bool => Scalar::Bool(false),
            BaseType::Long => Scalar::Long(0),
            BaseType::RaDec => Scalar::RaDec {
                ra: f64::NAN,
                dec: f64::NAN,
            },
            BaseType::AltAz => Scalar::AltAz {
                alt: f64::NAN,
                az: f64::NAN,
            },
        }
    }

    pub fn base_type(&self) -> BaseType {
        match self {
            Scalar::String(_) => BaseType::String,
            Scalar::Integer(_) => BaseType::Integer,
            Scalar::Time(_) => BaseType::Time,
            Scalar::Double(_) => BaseType::Double,
            Scalar::Float(_) => BaseType::Float,
            Scalar::Bool(_) => BaseType::Bool,
            Scalar::Long(_) => BaseType::Long,
            Scalar::RaDec { .. } => BaseType::RaDec,
            Scalar::AltAz { .. } => BaseType::AltAz,
        }
    }

    /// Consume the tokens of one scalar of kind `base`.
    pub fn parse(base: BaseType, params: &mut Params<'_>) -> Result<Self, ParseError> {
        Ok(match base {
            BaseType::String => Scalar::String(params.next_string()?),
            BaseType::Integer => Scalar::Integer(params.next_integer()?),
            BaseType::Time => Scalar::Time(params.next_double()?),
            BaseType::Double => Scalar::Double(params.next_double()?),
            BaseType::Float => Scalar::Float(parse_float(&params.next_string()?)?),
            BaseType::Bool => Scalar::Bool(parse_bool(&params.next_string()?)?),
            BaseType::Long => Scalar::Long(params.next_long()?),
            BaseType::RaDec => {
                let ra = parse_ra(&params.next_string()?)?;
                let dec = if params.is_empty() {
                    ra
                } else {
                    parse_degrees(&params.next_string()?)?
                };
                Scalar::RaDec { ra, dec }
            }
            BaseType::AltAz => {
                let alt = parse_degrees(&params.next_string()?)?;
                let az = if params.is_empty() {
                    alt
                } else {
                    parse_degrees(&params.next_string()?)?
                };
                Scalar::AltAz { alt, az }
            }
        })
    }

    /// Canonical wire text.
    pub fn render(&self) -> String {
        match self {
            Scalar::String(text) => quote(text),
            Scalar::Integer(v) => v.to_string(),
            Scalar::Long(v) => v.to_string(),
            Scalar::Time(v) | Scalar::Double(v) => format_double(*v),
            Scalar::Float(v) => format_float(*v),
            Scalar::Bool(v) => v.to_string(),
            Scalar::RaDec { ra: a, dec: b } | Scalar::AltAz { alt: a, az: b } => {
                format!("{} {}", format_double(*a), format_double(*b))
            }
        }
    }

    pub fn display(&self) -> String {
        match self {
            Scalar::String(text) => text.clone(),
            Scalar::Integer(v) => v.to_string(),
            Scalar::Long(v) => v.to_string(),
            Scalar::Time(v) | Scalar::Double(v) => display_double(*v),
            Scalar::Float(v) => display_double(f64::from(*v)),
            Scalar::Bool(v) => v.to_string(),
            Scalar::RaDec { ra: a, dec: b } | Scalar::AltAz { alt: a, az: b } => {
                format!("{} {}", display_double(*a), display_double(*b))
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(v) => Some(f64::from(*v)),
            Scalar::Long(v) => Some(*v as f64),
            Scalar::Time(v) | Scalar::Double(v) => Some(*v),
            Scalar::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Integer(v) => Some(i64::from(*v)),
            Scalar::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn apply(&mut self, op: DeltaOp, other: &Scalar) -> Result<(), OpError> {
        let target = self.base_type().name();
        let same_kind = self.base_type() == other.base_type();
        let incompatible = || OpError::Incompatible {
            target,
            operand: other.base_type().name(),
        };
        // Integral targets accept floating operands truncated toward zero.
        let integral = || {
            other
                .as_i64()
                .or_else(|| other.as_f64().map(|v| v as i64))
                .ok_or_else(incompatible)
        };

        match self {
            Scalar::String(text) => match (op, other) {
                (DeltaOp::Set, Scalar::String(new)) => text.clone_from(new),
                (DeltaOp::Set, _) => return Err(incompatible()),
                _ => return Err(unsupported(op, target)),
            },
            Scalar::Bool(flag) => match (op, other) {
                (DeltaOp::Set, Scalar::Bool(new)) => *flag = *new,
                (DeltaOp::Set, _) => return Err(incompatible()),
                _ => return Err(unsupported(op, target)),
            },
            Scalar::Integer(v) => {
                let result = combine_integral(i64::from(*v), op, integral()?)?;
                let overflow = OpError::OutOfRange(result as f64);
                *v = i32::try_from(result).map_err(|_| overflow)?;
            }
            Scalar::Long(v) => *v = combine_integral(*v, op, integral()?)?,
            Scalar::Time(v) | Scalar::Double(v) => {
                *v = combine(*v, op, other.as_f64().ok_or_else(incompatible)?);
            }
            Scalar::Float(v) => {
                let operand = other.as_f64().ok_or_else(incompatible)?;
                *v = combine(f64::from(*v), op, operand) as f32;
            }
            Scalar::RaDec { ra: a, dec: b } | Scalar::AltAz { alt: a, az: b } => {
                let (da, db) = match other {
                    Scalar::RaDec { ra, dec } if same_kind => (*ra, *dec),
                    Scalar::AltAz { alt, az } if same_kind => (*alt, *az),
                    _ => {
                        let both = other.as_f64().ok_or_else(incompatible)?;
                        (both, both)
                    }
                };
                *a = combine(*a, op, da);
                *b = combine(*b, op, db);
            }
        }
        Ok(())
    }
}

fn unsupported(op: DeltaOp, kind: &'static str) -> OpError {
    OpError::Unsupported {
        op: op.symbol(),
        kind,
    }
}

pub(crate) fn combine(current: f64, op: DeltaOp, operand: f64) -> f64 {
    match op {
        DeltaOp::Set => operand,
        DeltaOp::Add => current + operand,
        DeltaOp::Subtract => current - operand,
    }
}

fn combine_integral(current: i64, op: DeltaOp, operand: i64) -> Result<i64, OpError> {
    let result = match op {
        DeltaOp::Set => Some(operand),
        DeltaOp::Add => current.checked_add(operand),
        DeltaOp::Subtract => current.checked_sub(operand),
    };
    result.ok_or(OpError::OutOfRange(current as f64))
}

pub fn parse_bool(token: &str) -> Result<bool, ParseError> {
    match token.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(ParseError::InvalidBool(token.to_string())),
    }
}

fn parse_float(token: &str) -> Result<f32, ParseError> {
    if token.eq_ignore_ascii_case("nan") {
        return Ok(f32::NAN);
    }
    token
        .parse()
        .map_err(|_| ParseError::InvalidNumber(token.to_string()))
}

pub(crate) fn format_float(value: f32) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        format!("{value:.20e}")
    }
}

/// Human-facing rendering: plain decimals in the everyday range, exponent form outside it.
pub fn display_double(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value == 0.0 || (1e-3..1e8).contains(&value.abs()) {
        format!("{value:.6}")
    } else {
        format!("{value:e}")
    }
}

/// Angle in degrees from decimal text or `d:m[:s]`. The flag reports the sexagesimal form.
fn parse_angle(token: &str) -> Result<(f64, bool), ParseError> {
    let invalid = || ParseError::InvalidCoordinate(token.to_string());
    if !token.contains(':') {
        return parse_double(token).map(|v| (v, false)).map_err(|_| invalid());
    }

    let (negative, body) = match token.strip_prefix('-') {
        Some(body) => (true, body),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };

    let mut value = 0.0;
    let mut scale = 1.0;
    for (position, part) in body.split(':').enumerate() {
        let part: f64 = part.parse().map_err(|_| invalid())?;
        if position > 2 || part < 0.0 {
            return Err(invalid());
        }
        value += part / scale;
        scale *= 60.0;
    }
    Ok((if negative { -value } else { value }, true))
}

/// Right ascension in degrees; sexagesimal input is read as hours.
pub fn parse_ra(token: &str) -> Result<f64, ParseError> {
    let (value, sexagesimal) = parse_angle(token)?;
    Ok(if sexagesimal { value * 15.0 } else { value })
}

pub fn parse_degrees(token: &str) -> Result<f64, ParseError> {
    parse_angle(token).map(|(value, _)| value)
}
