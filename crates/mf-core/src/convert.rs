//! # Value Converter
//!
//! Maps dynamically typed BSON values onto frame [`Cell`]s. Every BSON kind
//! the driver can decode lands on exactly one cell type; null and undefined
//! carry no type signal and come back as `(None, Unknown)`.

use crate::frame::{Cell, FieldType};
use bson::{Bson, Decimal128};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConvertError {
    #[error("Got value with a type not expected to be generated by BSON: {0}")]
    UnexpectedKind(String),
    #[error("Date-time out of range: {0} ms since epoch")]
    DateTimeOutOfRange(i64),
    #[error("JSON cell is not valid extended JSON: {0}")]
    InvalidExtendedJson(String),
}

/// Convert a BSON value into a cell and its scalar type.
pub fn to_frame_value(value: &Bson) -> Result<(Option<Cell>, FieldType), ConvertError> {
    let cell = match value {
        Bson::Null | Bson::Undefined => return Ok((None, FieldType::Unknown)),
        Bson::Int32(v) => Cell::Int32(*v),
        Bson::Int64(v) => Cell::Int64(*v),
        Bson::Double(v) => Cell::Float64(*v),
        Bson::String(v) => Cell::String(v.clone()),
        Bson::Boolean(v) => Cell::Bool(*v),
        Bson::Document(_) | Bson::Array(_) => Cell::Json(value.clone().into_relaxed_extjson()),
        Bson::ObjectId(oid) => Cell::String(oid.to_hex()),
        Bson::DateTime(dt) => {
            let millis = dt.timestamp_millis();
            let time = DateTime::<Utc>::from_timestamp_millis(millis)
                .ok_or(ConvertError::DateTimeOutOfRange(millis))?;
            Cell::Time(time)
        }
        Bson::Binary(binary) => Cell::String(hex::encode(&binary.bytes)),
        Bson::RegularExpression(regex) => Cell::String(regex.pattern.clone()),
        Bson::JavaScriptCode(code) => Cell::String(code.clone()),
        Bson::JavaScriptCodeWithScope(code) => Cell::String(code.code.clone()),
        Bson::Timestamp(ts) => {
            let secs = i64::from(ts.time);
            let time = DateTime::<Utc>::from_timestamp(secs, 0)
                .ok_or(ConvertError::DateTimeOutOfRange(secs * 1000))?;
            Cell::Time(time)
        }
        Bson::Decimal128(dec) => Cell::Float64(decimal128_to_f64(dec)),
        Bson::MinKey | Bson::MaxKey | Bson::DbPointer(_) => {
            Cell::String(value.clone().into_relaxed_extjson().to_string())
        }
        Bson::Symbol(symbol) => Cell::String(symbol.clone()),
        #[allow(unreachable_patterns)]
        other => return Err(ConvertError::UnexpectedKind(format!("{:?}", other))),
    };
    let field_type = cell.field_type();
    Ok((Some(cell), field_type))
}

/// Convert a (possibly absent) value, reporting the nullable variant of the
/// type when `nullable` is requested and the cell is non-null.
pub fn convert_value(
    value: Option<&Bson>,
    nullable: bool,
) -> Result<(Option<Cell>, FieldType), ConvertError> {
    let Some(value) = value else {
        return Ok((None, FieldType::Unknown));
    };
    let (cell, field_type) = to_frame_value(value)?;
    if cell.is_none() || !nullable {
        return Ok((cell, field_type));
    }
    Ok((cell, field_type.nullable()))
}

/// Decode an IEEE 754-2008 BID decimal128 into the nearest `f64`.
///
/// The coefficient and exponent are rendered as decimal text first so the
/// final rounding is done once, by the float parser.
pub fn decimal128_to_f64(dec: &Decimal128) -> f64 {
    const EXPONENT_BIAS: i32 = 6176;

    let bits = u128::from_le_bytes(dec.bytes());
    let negative = bits >> 127 == 1;
    let combination = (bits >> 122) & 0x1f;
    if combination == 0x1f {
        return f64::NAN;
    }
    if combination == 0x1e {
        return if negative {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        };
    }

    let (exponent, coefficient) = if (bits >> 125) & 0b11 == 0b11 {
        // Implicit 0b100 prefix: always above 10^34, so non-canonical zero.
        (((bits >> 111) & 0x3fff) as i32, 0u128)
    } else {
        (((bits >> 113) & 0x3fff) as i32, bits & ((1u128 << 113) - 1))
    };

    let sign = if negative { "-" } else { "" };
    format!("{}{}e{}", sign, coefficient, exponent - EXPONENT_BIAS)
        .parse::<f64>()
        .unwrap_or(f64::NAN)
}

impl Cell {
    /// The BSON value this cell was (or could have been) decoded from.
    /// JSON cells are read as relaxed extended JSON.
    pub fn to_bson(&self) -> Result<Bson, ConvertError> {
        let value = match self {
            Self::Int32(v) => Bson::Int32(*v),
            Self::Int64(v) => Bson::Int64(*v),
            Self::Float64(v) => Bson::Double(*v),
            Self::String(v) => Bson::String(v.clone()),
            Self::Bool(v) => Bson::Boolean(*v),
            Self::Time(v) => Bson::DateTime(bson::DateTime::from_millis(v.timestamp_millis())),
            Self::Json(v) => Bson::try_from(v.clone())
                .map_err(|e| ConvertError::InvalidExtendedJson(e.to_string()))?,
        };
        Ok(value)
    }
}
