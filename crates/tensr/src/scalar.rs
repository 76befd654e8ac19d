//! Tagged scalar values with numeric type promotion.
//!
//! A [`Scalar`] remembers the fine-grained [`ScalarType`] it was built from
//! while storing the payload widened to 64 bits, so conversions can check
//! ranges and arithmetic can promote both operands before operating.

use std::fmt;

use thiserror::Error;

/// Errors raised by scalar conversions and arithmetic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScalarError {
    #[error("{0}")]
    Conversion(String),
    #[error("{0}")]
    Arithmetic(String),
}

impl ScalarError {
    fn conversion(msg: impl Into<String>) -> Self {
        ScalarError::Conversion(msg.into())
    }

    fn arithmetic(msg: impl Into<String>) -> Self {
        ScalarError::Arithmetic(msg.into())
    }
}

/// Fine-grained numeric type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    Invalid,
}

impl ScalarType {
    /// Bytes occupied by one value of this type in a packed buffer.
    pub fn size_in_bytes(self) -> usize {
        match self {
            ScalarType::Int8 | ScalarType::UInt8 | ScalarType::Bool => 1,
            ScalarType::Int16 | ScalarType::UInt16 => 2,
            ScalarType::Int32 | ScalarType::UInt32 | ScalarType::Float32 => 4,
            ScalarType::Int64 | ScalarType::UInt64 | ScalarType::Float64 => 8,
            ScalarType::Invalid => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Int8 => "int8",
            ScalarType::Int16 => "int16",
            ScalarType::Int32 => "int32",
            ScalarType::Int64 => "int64",
            ScalarType::UInt8 => "uint8",
            ScalarType::UInt16 => "uint16",
            ScalarType::UInt32 => "uint32",
            ScalarType::UInt64 => "uint64",
            ScalarType::Float32 => "float32",
            ScalarType::Float64 => "float64",
            ScalarType::Bool => "bool",
            ScalarType::Invalid => "invalid",
        }
    }

    pub fn is_integral(self) -> bool {
        matches!(
            self,
            ScalarType::Int8
                | ScalarType::Int16
                | ScalarType::Int32
                | ScalarType::Int64
                | ScalarType::UInt8
                | ScalarType::UInt16
                | ScalarType::UInt32
                | ScalarType::UInt64
        )
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, ScalarType::Float32 | ScalarType::Float64)
    }

    pub fn is_unsigned(self) -> bool {
        matches!(
            self,
            ScalarType::UInt8 | ScalarType::UInt16 | ScalarType::UInt32 | ScalarType::UInt64
        )
    }

    pub fn is_valid(self) -> bool {
        self != ScalarType::Invalid
    }

    fn bit_width(self) -> u32 {
        match self {
            ScalarType::Int8 | ScalarType::UInt8 => 8,
            ScalarType::Int16 | ScalarType::UInt16 => 16,
            ScalarType::Int32 | ScalarType::UInt32 => 32,
            ScalarType::Int64 | ScalarType::UInt64 => 64,
            _ => 0,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Computes the common type two scalars promote to before arithmetic.
///
/// Bool defers to the other operand; floats beat integers (Float64 wins over
/// Float32); same-signedness integers take the wider type; mixed signedness
/// takes the unsigned type when it is at least as wide, otherwise the signed
/// type one width up.
pub fn promote_types(a: ScalarType, b: ScalarType) -> ScalarType {
    if a == b {
        return a;
    }
    if a == ScalarType::Invalid || b == ScalarType::Invalid {
        return ScalarType::Invalid;
    }
    if a == ScalarType::Bool {
        return b;
    }
    if b == ScalarType::Bool {
        return a;
    }
    if a.is_floating_point() || b.is_floating_point() {
        if a == ScalarType::Float64 || b == ScalarType::Float64 {
            return ScalarType::Float64;
        }
        return ScalarType::Float32;
    }

    let (a_width, b_width) = (a.bit_width(), b.bit_width());
    if a.is_unsigned() == b.is_unsigned() {
        return if a_width >= b_width { a } else { b };
    }
    let (unsigned, signed) = if a.is_unsigned() { (a, b) } else { (b, a) };
    if unsigned.bit_width() >= signed.bit_width() {
        return unsigned;
    }
    match signed.bit_width() {
        8 => ScalarType::Int16,
        16 => ScalarType::Int32,
        _ => ScalarType::Int64,
    }
}

#[derive(Debug, Clone, Copy)]
enum Payload {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

/// A single numeric value tagged with its fine-grained type.
#[derive(Debug, Clone, Copy)]
pub struct Scalar {
    ty: ScalarType,
    payload: Payload,
}

macro_rules! scalar_from_signed {
    ($($from:ty => $ty:expr),* $(,)?) => {
        $(impl From<$from> for Scalar {
            fn from(value: $from) -> Self {
                Scalar { ty: $ty, payload: Payload::Int(value as i64) }
            }
        })*
    };
}

macro_rules! scalar_from_unsigned {
    ($($from:ty => $ty:expr),* $(,)?) => {
        $(impl From<$from> for Scalar {
            fn from(value: $from) -> Self {
                Scalar { ty: $ty, payload: Payload::UInt(value as u64) }
            }
        })*
    };
}

scalar_from_signed! {
    i8 => ScalarType::Int8,
    i16 => ScalarType::Int16,
    i32 => ScalarType::Int32,
    i64 => ScalarType::Int64,
}

scalar_from_unsigned! {
    u8 => ScalarType::UInt8,
    u16 => ScalarType::UInt16,
    u32 => ScalarType::UInt32,
    u64 => ScalarType::UInt64,
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar {
            ty: ScalarType::Float32,
            payload: Payload::Float(value as f64),
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar {
            ty: ScalarType::Float64,
            payload: Payload::Float(value),
        }
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar {
            ty: ScalarType::Bool,
            payload: Payload::Bool(value),
        }
    }
}

const FLOAT_EQ_EPSILON: f64 = 1e-7;

fn almost_equal(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    if a.abs() < FLOAT_EQ_EPSILON && b.abs() < FLOAT_EQ_EPSILON {
        return true;
    }
    let diff = (a - b).abs();
    diff <= a.abs().max(b.abs()) * FLOAT_EQ_EPSILON
}

fn is_integral_float(value: f64) -> bool {
    (value - value.round()).abs() < FLOAT_EQ_EPSILON
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        self.ty
    }

    pub fn is_integral(&self) -> bool {
        self.ty.is_integral()
    }

    pub fn is_floating_point(&self) -> bool {
        self.ty.is_floating_point()
    }

    pub fn is_bool(&self) -> bool {
        self.ty == ScalarType::Bool
    }

    /// Converts to `i64`, rejecting lossy or out-of-range values.
    pub fn to_i64(&self) -> Result<i64, ScalarError> {
        match self.payload {
            Payload::Int(v) => Ok(v),
            Payload::UInt(v) => i64::try_from(v)
                .map_err(|_| ScalarError::conversion("uint64 value too large for int64")),
            Payload::Float(v) => {
                if !is_integral_float(v) {
                    return Err(ScalarError::conversion(
                        "cannot convert non-integer float to int64",
                    ));
                }
                if v > i64::MAX as f64 || v < i64::MIN as f64 {
                    return Err(ScalarError::conversion("float value out of range for int64"));
                }
                Ok(v as i64)
            }
            Payload::Bool(v) => Ok(v as i64),
        }
    }

    /// Converts to `u64`, rejecting negatives and lossy values.
    pub fn to_u64(&self) -> Result<u64, ScalarError> {
        match self.payload {
            Payload::Int(v) => u64::try_from(v)
                .map_err(|_| ScalarError::conversion("cannot convert negative integer to uint64")),
            Payload::UInt(v) => Ok(v),
            Payload::Float(v) => {
                if !is_integral_float(v) || v < 0.0 {
                    return Err(ScalarError::conversion(
                        "cannot convert non-integral or negative float to uint64",
                    ));
                }
                if v > u64::MAX as f64 {
                    return Err(ScalarError::conversion("float value too large for uint64"));
                }
                Ok(v as u64)
            }
            Payload::Bool(v) => Ok(v as u64),
        }
    }

    /// Converts to `f64`; every non-bool payload widens losslessly enough.
    pub fn to_f64(&self) -> Result<f64, ScalarError> {
        match self.payload {
            Payload::Int(v) => Ok(v as f64),
            Payload::UInt(v) => Ok(v as f64),
            Payload::Float(v) => Ok(v),
            Payload::Bool(_) => Err(ScalarError::conversion("cannot convert bool to float64")),
        }
    }

    /// Converts to `bool`; only bool and 0/1 integers qualify.
    pub fn to_bool(&self) -> Result<bool, ScalarError> {
        match self.payload {
            Payload::Bool(v) => Ok(v),
            Payload::Int(0) | Payload::UInt(0) => Ok(false),
            Payload::Int(1) | Payload::UInt(1) => Ok(true),
            _ => Err(ScalarError::conversion("cannot convert value to bool")),
        }
    }

    /// Negation; unsigned values and bools do not negate.
    pub fn neg(&self) -> Result<Scalar, ScalarError> {
        match self.payload {
            Payload::Float(v) => Ok(Scalar::from(-v)),
            Payload::Int(v) => v
                .checked_neg()
                .map(Scalar::from)
                .ok_or_else(|| ScalarError::arithmetic("integer overflow in negation")),
            Payload::UInt(0) => Ok(Scalar::from(0u64)),
            Payload::UInt(_) => Err(ScalarError::arithmetic("cannot negate unsigned value")),
            Payload::Bool(_) => Err(ScalarError::arithmetic("cannot negate boolean value")),
        }
    }

    pub fn add(&self, other: &Scalar) -> Result<Scalar, ScalarError> {
        self.binary_op(other, "addition", i64::checked_add, u64::checked_add, |a, b| {
            a + b
        })
    }

    pub fn sub(&self, other: &Scalar) -> Result<Scalar, ScalarError> {
        self.binary_op(other, "subtraction", i64::checked_sub, u64::checked_sub, |a, b| {
            a - b
        })
    }

    pub fn mul(&self, other: &Scalar) -> Result<Scalar, ScalarError> {
        self.binary_op(other, "multiplication", i64::checked_mul, u64::checked_mul, |a, b| {
            a * b
        })
    }

    /// Division; integer operands stay integral only when the quotient is
    /// exact, otherwise the result promotes to float.
    pub fn div(&self, other: &Scalar) -> Result<Scalar, ScalarError> {
        if self.is_bool() || other.is_bool() {
            return Err(ScalarError::arithmetic("cannot divide boolean values"));
        }
        let denominator = other.to_f64()?;
        if denominator.abs() < f64::EPSILON {
            return Err(ScalarError::arithmetic("division by zero"));
        }
        if self.is_integral() && other.is_integral() {
            let quotient = self.to_f64()? / denominator;
            if quotient.floor() == quotient
                && quotient <= i64::MAX as f64
                && quotient >= i64::MIN as f64
            {
                return Ok(Scalar::from(quotient as i64));
            }
            return Ok(Scalar::from(quotient));
        }
        Ok(Scalar::from(self.to_f64()? / denominator))
    }

    fn binary_op(
        &self,
        other: &Scalar,
        op_name: &str,
        int_op: fn(i64, i64) -> Option<i64>,
        uint_op: fn(u64, u64) -> Option<u64>,
        float_op: fn(f64, f64) -> f64,
    ) -> Result<Scalar, ScalarError> {
        if self.is_bool() || other.is_bool() {
            return Err(ScalarError::arithmetic(format!(
                "cannot apply {op_name} to boolean values"
            )));
        }
        if self.is_floating_point() || other.is_floating_point() {
            return Ok(Scalar::from(float_op(self.to_f64()?, other.to_f64()?)));
        }
        // Same-signedness fast path keeps unsigned results unsigned.
        if self.ty.is_unsigned() && other.ty.is_unsigned() {
            return uint_op(self.to_u64()?, other.to_u64()?)
                .map(Scalar::from)
                .ok_or_else(|| {
                    ScalarError::arithmetic(format!("unsigned integer overflow in {op_name}"))
                });
        }
        int_op(self.to_i64()?, other.to_i64()?)
            .map(Scalar::from)
            .ok_or_else(|| ScalarError::arithmetic(format!("integer overflow in {op_name}")))
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        // Bool only ever equals bool.
        if self.is_bool() || other.is_bool() {
            return match (self.payload, other.payload) {
                (Payload::Bool(a), Payload::Bool(b)) => a == b,
                _ => false,
            };
        }
        if self.is_floating_point() || other.is_floating_point() {
            return match (self.to_f64(), other.to_f64()) {
                (Ok(a), Ok(b)) => almost_equal(a, b),
                _ => false,
            };
        }
        match (self.to_i64(), other.to_i64()) {
            (Ok(a), Ok(b)) => a == b,
            _ => match (self.to_u64(), other.to_u64()) {
                (Ok(a), Ok(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            Payload::Int(v) => write!(f, "{v}"),
            Payload::UInt(v) => write!(f, "{v}"),
            Payload::Float(v) => write!(f, "{v}"),
            Payload::Bool(v) => write!(f, "{v}"),
        }
    }
}
