//! Pairwise conversions between dish representations.
//!
//! A handful of direct text paths exist; every other pair goes through the
//! byte sequence as a hub (`source -> bytes -> target`). `Html` is a sink and
//! a file list only flattens to binary.

use std::str::FromStr;

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde::Serialize;
use serde_json::Value;
use serde_json::ser::PrettyFormatter;

use super::{DishFile, DishType, DishValue};
use crate::error::DishError;

/// Widest scale written out positionally; anything larger keeps its exponent.
const PLAIN_SCALE_LIMIT: i64 = 4096;

/// Decimal digits of `i64::MAX`.
const I64_DIGITS: i64 = 19;

/// Reads a different representation without consuming `value`. Text is
/// decoded straight from a borrowed binary payload.
pub(super) fn convert_ref(value: &DishValue, target: DishType) -> Result<DishValue, DishError> {
    match (value, target) {
        (DishValue::ByteArray(bytes) | DishValue::ArrayBuffer(bytes), DishType::String) => {
            utf8(bytes, value.dish_type(), target).map(DishValue::String)
        }
        _ => convert(value.clone(), target),
    }
}

pub(super) fn convert(value: DishValue, target: DishType) -> Result<DishValue, DishError> {
    let source = value.dish_type();
    if source == target {
        return Ok(value);
    }

    match (value, target) {
        (DishValue::Html(_), _) => Err(DishError::NoConversionPath {
            from: source,
            to: target,
        }),
        (DishValue::ListFile(_), target) if !target.is_binary() => {
            Err(DishError::NoConversionPath {
                from: source,
                to: target,
            })
        }
        (DishValue::ByteArray(bytes), DishType::ArrayBuffer) => Ok(DishValue::ArrayBuffer(bytes)),
        (DishValue::ArrayBuffer(bytes), DishType::ByteArray) => Ok(DishValue::ByteArray(bytes)),
        (DishValue::Number(n), DishType::String) => Ok(DishValue::String(n.to_string())),
        (DishValue::BigNumber(n), DishType::String) => Ok(DishValue::String(decimal_text(&n))),
        (DishValue::Json(json), DishType::String) => json_to_text(&json).map(DishValue::String),
        (DishValue::String(text), DishType::Number) => parse_integer(&text, source),
        (DishValue::String(text), DishType::BigNumber) => parse_decimal(&text, source),
        (DishValue::String(text), DishType::Json) => parse_json(&text, source),
        (DishValue::Number(n), DishType::BigNumber) => Ok(DishValue::BigNumber(BigDecimal::from(n))),
        (DishValue::BigNumber(n), DishType::Number) => decimal_to_integer(&n, source),
        (value, target) => {
            let bytes = to_bytes(value)?;
            from_bytes(bytes, source, target)
        }
    }
}

fn to_bytes(value: DishValue) -> Result<Vec<u8>, DishError> {
    let source = value.dish_type();
    match value {
        DishValue::ByteArray(bytes) | DishValue::ArrayBuffer(bytes) => Ok(bytes.into_vec()),
        DishValue::String(text) => Ok(text.into_bytes()),
        DishValue::Number(n) => Ok(n.to_string().into_bytes()),
        DishValue::BigNumber(n) => Ok(decimal_text(&n).into_bytes()),
        DishValue::Json(json) => json_to_text(&json).map(String::into_bytes),
        DishValue::ListFile(files) => Ok(files.into_iter().flat_map(|file| file.data).collect()),
        DishValue::Html(_) => Err(DishError::NoConversionPath {
            from: source,
            to: DishType::ByteArray,
        }),
    }
}

/// `source` is the type the chain started from, kept for error reporting.
fn from_bytes(bytes: Vec<u8>, source: DishType, target: DishType) -> Result<DishValue, DishError> {
    match target {
        DishType::ByteArray => Ok(DishValue::ByteArray(bytes.into())),
        DishType::ArrayBuffer => Ok(DishValue::ArrayBuffer(bytes.into())),
        DishType::String => utf8_owned(bytes, source, target).map(DishValue::String),
        DishType::Html => utf8_owned(bytes, source, target).map(DishValue::Html),
        DishType::Number => parse_integer(&utf8_owned(bytes, source, target)?, source),
        DishType::BigNumber => parse_decimal(&utf8_owned(bytes, source, target)?, source),
        DishType::Json => parse_json(&utf8_owned(bytes, source, target)?, source),
        DishType::ListFile => Ok(DishValue::ListFile(vec![DishFile::new("unknown", bytes)])),
    }
}

fn utf8(bytes: &[u8], source: DishType, target: DishType) -> Result<String, DishError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|err| DishError::malformed(source, target, format!("invalid UTF-8: {err}")))
}

fn utf8_owned(bytes: Vec<u8>, source: DishType, target: DishType) -> Result<String, DishError> {
    String::from_utf8(bytes)
        .map_err(|err| DishError::malformed(source, target, format!("invalid UTF-8: {err}")))
}

fn parse_integer(text: &str, source: DishType) -> Result<DishValue, DishError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(DishValue::Number(0));
    }
    if let Ok(n) = trimmed.parse::<i64>() {
        return Ok(DishValue::Number(n));
    }
    let decimal = BigDecimal::from_str(trimmed).map_err(|_| {
        DishError::malformed(source, DishType::Number, format!("'{trimmed}' is not a number"))
    })?;
    decimal_to_integer(&decimal, source)
}

fn decimal_to_integer(decimal: &BigDecimal, source: DishType) -> Result<DishValue, DishError> {
    if decimal.is_zero() {
        return Ok(DishValue::Number(0));
    }
    // Bound the magnitude from the digit count before anything expands the
    // exponent.
    let (digits, scale) = decimal.as_bigint_and_exponent();
    let width = digits.magnitude().to_string().len() as i64;
    if width.saturating_sub(scale) > I64_DIGITS {
        return Err(out_of_range(decimal, source));
    }
    if scale >= width || !decimal.is_integer() {
        return Err(DishError::malformed(
            source,
            DishType::Number,
            format!("{} is not an integer", decimal_text(decimal)),
        ));
    }
    decimal
        .to_i64()
        .map(DishValue::Number)
        .ok_or_else(|| out_of_range(decimal, source))
}

fn out_of_range(decimal: &BigDecimal, source: DishType) -> DishError {
    DishError::malformed(
        source,
        DishType::Number,
        format!("{} does not fit in 64 bits", decimal_text(decimal)),
    )
}

/// Positional text for ordinary scales, `<digits>E<exponent>` otherwise.
/// Both forms parse back to the same value.
pub(crate) fn decimal_text(decimal: &BigDecimal) -> String {
    let (digits, scale) = decimal.as_bigint_and_exponent();
    if scale.unsigned_abs() <= PLAIN_SCALE_LIMIT as u64 {
        decimal.to_plain_string()
    } else {
        format!("{digits}E{}", -scale)
    }
}

fn parse_decimal(text: &str, source: DishType) -> Result<DishValue, DishError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(DishValue::BigNumber(BigDecimal::from(0)));
    }
    BigDecimal::from_str(trimmed)
        .map(DishValue::BigNumber)
        .map_err(|_| {
            DishError::malformed(
                source,
                DishType::BigNumber,
                format!("'{trimmed}' is not a decimal number"),
            )
        })
}

fn parse_json(text: &str, source: DishType) -> Result<DishValue, DishError> {
    serde_json::from_str(text)
        .map(DishValue::Json)
        .map_err(|err| DishError::malformed(source, DishType::Json, err))
}

pub(crate) fn json_to_text(json: &Value) -> Result<String, DishError> {
    json_with_indent(json, "    ")
        .map_err(|err| DishError::malformed(DishType::Json, DishType::String, err))
}

pub(crate) fn json_with_indent(json: &Value, indent: &str) -> Result<String, serde_json::Error> {
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(indent.as_bytes());
    let mut serializer = serde_json::Serializer::with_formatter(&mut buffer, formatter);
    json.serialize(&mut serializer)?;
    // serde_json only ever writes valid UTF-8.
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
