//! Avro binary datum decoding into [Value]
use std::time::Duration;

use apache_avro::{
    from_avro_datum,
    schema::{DecimalSchema, NamesRef, ResolvedSchema},
    types::Value as AvroValue,
    Schema,
};

use super::DecodeError;
use crate::value::Value;

/// Decodes single Avro datum (no container header) written with `schema`
pub fn decode_body(schema: &Schema, body: &[u8]) -> Result<Value, DecodeError> {
    let mut datum = body;
    let v = from_avro_datum(schema, &mut datum, None)
        .map_err(|e| DecodeError::Malformed(format!("avro unmarshalling: {e}")))?;
    let resolved = ResolvedSchema::try_from(schema)
        .map_err(|e| DecodeError::Malformed(format!("resolving schema names: {e}")))?;
    avro2value(v, Some(schema), resolved.get_names())
}

/// Converts decoded value, walking `schema` alongside it so decimals get their scale
fn avro2value<'s>(
    v: AvroValue,
    schema: Option<&'s Schema>,
    names: &NamesRef<'s>,
) -> Result<Value, DecodeError> {
    let schema = match schema {
        Some(Schema::Ref { name }) => names.get(name).copied(),
        other => other,
    };
    match v {
        AvroValue::Null => Ok(Value::Null),
        AvroValue::Boolean(x) => Ok(Value::Bool(x)),
        AvroValue::Int(x) => Ok(Value::from(x)),
        AvroValue::Long(x) => Ok(Value::Int(x)),
        AvroValue::Float(x) => Ok(Value::Float(f64::from(x))),
        AvroValue::Double(x) => Ok(Value::Float(x)),
        AvroValue::Bytes(x) => Ok(Value::Bytes(x)),
        AvroValue::Fixed(_, x) => Ok(Value::Bytes(x)),
        AvroValue::String(x) => Ok(Value::String(x)),
        AvroValue::Enum(_, x) => Ok(Value::String(x)),
        AvroValue::Union(i, x) => {
            let branch = match schema {
                Some(Schema::Union(u)) => usize::try_from(i).ok().and_then(|i| u.variants().get(i)),
                _ => None,
            };
            avro2value(*x, branch, names)
        }
        AvroValue::Array(x) => {
            let items = match schema {
                Some(Schema::Array(items)) => Some(items.as_ref()),
                _ => None,
            };
            Ok(Value::Sequence(
                x.into_iter()
                    .map(|v| avro2value(v, items, names))
                    .collect::<Result<_, _>>()?,
            ))
        }
        AvroValue::Map(x) => {
            let values = match schema {
                Some(Schema::Map(values)) => Some(values.as_ref()),
                _ => None,
            };
            // map order is unspecified, sort to keep decoding deterministic
            let mut entries = x.into_iter().collect::<Vec<_>>();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut m = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                m.push((Value::String(k), avro2value(v, values, names)?));
            }
            Ok(Value::Mapping(m))
        }
        AvroValue::Record(x) => {
            let fields = match schema {
                Some(Schema::Record(rs)) => Some(&rs.fields),
                _ => None,
            };
            let mut m = Vec::with_capacity(x.len());
            for (i, (field, v)) in x.into_iter().enumerate() {
                let field_schema = fields.and_then(|f| f.get(i)).map(|f| &f.schema);
                m.push((Value::String(field), avro2value(v, field_schema, names)?));
            }
            Ok(Value::Mapping(m))
        }
        AvroValue::Date(x) => Ok(Value::from(x)),
        AvroValue::TimeMillis(x) => Ok(Value::from(x)),
        AvroValue::TimeMicros(x) => Ok(Value::Int(x)),
        AvroValue::TimestampMillis(x) => Ok(Value::Int(x)),
        AvroValue::TimestampMicros(x) => Ok(Value::Int(x)),
        AvroValue::LocalTimestampMillis(x) => Ok(Value::Int(x)),
        AvroValue::LocalTimestampMicros(x) => Ok(Value::Int(x)),
        AvroValue::Duration(x) => {
            // months are taken as 30 days
            let duration = Duration::from_millis(u64::from(u32::from(x.millis())))
                + Duration::from_secs(86400 * u64::from(u32::from(x.days())))
                + Duration::from_secs(30 * 86400 * u64::from(u32::from(x.months())));
            i64::try_from(duration.as_millis())
                .map(Value::Int)
                .map_err(|_| DecodeError::Malformed(format!("duration {duration:?} overflows")))
        }
        AvroValue::Uuid(x) => Ok(Value::String(x.to_string())),
        AvroValue::Decimal(x) => {
            let Some(Schema::Decimal(DecimalSchema { scale, .. })) = schema else {
                return Err(DecodeError::Malformed(String::from(
                    "decimal value without decimal schema",
                )));
            };
            let unscaled = <Vec<u8>>::try_from(&x)
                .map_err(|e| DecodeError::Malformed(format!("decimal bytes: {e}")))?;
            Ok(Value::String(decimal_string(&unscaled, *scale)))
        }
    }
}

/// Renders big-endian two's complement unscaled integer as plain decimal string
fn decimal_string(unscaled: &[u8], scale: usize) -> String {
    let negative = unscaled.first().is_some_and(|b| b & 0x80 != 0);
    let mut magnitude = unscaled.to_vec();
    if negative {
        for b in magnitude.iter_mut() {
            *b = !*b;
        }
        for b in magnitude.iter_mut().rev() {
            let (x, carry) = b.overflowing_add(1);
            *b = x;
            if !carry {
                break;
            }
        }
    }

    // least significant digit first
    let mut digits = Vec::new();
    while magnitude.iter().any(|&b| b != 0) {
        let mut rem = 0u32;
        for b in magnitude.iter_mut() {
            let cur = (rem << 8) | u32::from(*b);
            *b = (cur / 10) as u8;
            rem = cur % 10;
        }
        digits.push(char::from(b'0' + rem as u8));
    }
    while digits.len() <= scale {
        digits.push('0');
    }

    let mut s = String::with_capacity(digits.len() + 2);
    if negative {
        s.push('-');
    }
    let point = digits.len() - scale;
    for (i, d) in digits.iter().rev().enumerate() {
        if i == point {
            s.push('.');
        }
        s.push(*d);
    }
    s
}
