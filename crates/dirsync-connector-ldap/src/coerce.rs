//! Attribute coercion.
//!
//! Converts raw directory values into JSON-native [`AttributeValue`]s.
//! A few Active Directory attributes carry binary syntaxes and are decoded by
//! name; everything else is parsed according to the requested scalar type.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use ldap3::SearchEntry;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::{AttributeConfig, AttributeSet, AttributeType, AttributeValue};

/// Binary attribute syntaxes decoded by attribute name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySyntax {
    Guid,
    Sid,
    SecurityDescriptor,
}

impl BinarySyntax {
    pub fn for_attribute(name: &str) -> Option<Self> {
        const GUIDS: [&str; 2] = ["objectGUID", "mS-DS-ConsistencyGuid"];
        const SIDS: [&str; 2] = ["objectSid", "sIDHistory"];
        const DESCRIPTORS: [&str; 2] = [
            "nTSecurityDescriptor",
            "msDS-AllowedToActOnBehalfOfOtherIdentity",
        ];

        let matches = |names: &[&str]| names.iter().any(|n| n.eq_ignore_ascii_case(name));
        if matches(&GUIDS) {
            Some(BinarySyntax::Guid)
        } else if matches(&SIDS) {
            Some(BinarySyntax::Sid)
        } else if matches(&DESCRIPTORS) {
            Some(BinarySyntax::SecurityDescriptor)
        } else {
            None
        }
    }
}

/// Values of `name` in `map`, ignoring case and attribute options such as
/// `;range=0-1499` or `;binary`.
pub fn values_ignore_case<'a, T>(map: &'a HashMap<String, Vec<T>>, name: &str) -> Option<&'a Vec<T>> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| {
                key.split(';')
                    .next()
                    .is_some_and(|base| base.eq_ignore_ascii_case(name))
            })
            .map(|(_, values)| values)
    })
}

/// Convert one search entry into a flat object.
///
/// `dn` is always present. Requested attributes missing from the entry become
/// an empty string, or an empty list for list-typed attributes.
pub fn entry_to_object(
    entry: &SearchEntry,
    attributes: &[AttributeConfig],
) -> ConnectorResult<AttributeSet> {
    let mut object = AttributeSet::new().with("dn", entry.dn.as_str());

    for attribute in attributes {
        if attribute.external_id.eq_ignore_ascii_case("dn") {
            continue;
        }

        let value = match BinarySyntax::for_attribute(&attribute.external_id) {
            Some(syntax) => coerce_binary_attribute(entry, attribute, syntax)?,
            None => coerce_text_attribute(entry, attribute)?,
        };
        object.set(attribute.external_id.clone(), value);
    }

    Ok(object)
}

fn empty_value(attribute: &AttributeConfig) -> AttributeValue {
    if attribute.list {
        AttributeValue::Array(Vec::new())
    } else {
        AttributeValue::String(String::new())
    }
}

fn collect_values<T>(
    attribute: &AttributeConfig,
    raw: Vec<T>,
    coerce: impl Fn(T) -> ConnectorResult<AttributeValue>,
) -> ConnectorResult<AttributeValue> {
    if attribute.list {
        raw.into_iter()
            .map(coerce)
            .collect::<ConnectorResult<Vec<_>>>()
            .map(AttributeValue::Array)
    } else {
        match raw.into_iter().next() {
            Some(first) => coerce(first),
            None => Ok(empty_value(attribute)),
        }
    }
}

fn coerce_binary_attribute(
    entry: &SearchEntry,
    attribute: &AttributeConfig,
    syntax: BinarySyntax,
) -> ConnectorResult<AttributeValue> {
    let name = attribute.external_id.as_str();

    // ldap3 files values that happen to be valid UTF-8 under `attrs`.
    let raw: Vec<Vec<u8>> = match values_ignore_case(&entry.bin_attrs, name) {
        Some(values) => values.clone(),
        None => match values_ignore_case(&entry.attrs, name) {
            Some(values) => values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            None => return Ok(empty_value(attribute)),
        },
    };

    collect_values(attribute, raw, |bytes| {
        decode_binary(name, syntax, &bytes).map(AttributeValue::String)
    })
}

fn coerce_text_attribute(
    entry: &SearchEntry,
    attribute: &AttributeConfig,
) -> ConnectorResult<AttributeValue> {
    let name = attribute.external_id.as_str();

    let raw: Vec<String> = match values_ignore_case(&entry.attrs, name) {
        Some(values) => values.clone(),
        None if values_ignore_case(&entry.bin_attrs, name).is_some() => {
            return Err(ConnectorError::invalid_attribute_type(
                name,
                "value is not valid UTF-8",
            ))
        }
        None => return Ok(empty_value(attribute)),
    };

    collect_values(attribute, raw, |value| {
        coerce_scalar(name, attribute.attribute_type, &value)
    })
}

/// Decode a binary syntax value into its canonical string form.
pub fn decode_binary(name: &str, syntax: BinarySyntax, bytes: &[u8]) -> ConnectorResult<String> {
    if bytes.is_empty() {
        return Err(ConnectorError::invalid_attribute_type(
            name,
            "binary value has no bytes",
        ));
    }

    match syntax {
        BinarySyntax::Guid => {
            let raw: [u8; 16] = bytes.try_into().map_err(|_| {
                ConnectorError::invalid_attribute_type(
                    name,
                    format!("GUID must be 16 bytes, got {}", bytes.len()),
                )
            })?;
            Ok(Uuid::from_bytes_le(raw).to_string())
        }
        BinarySyntax::Sid => decode_sid(bytes)
            .ok_or_else(|| ConnectorError::invalid_attribute_type(name, "malformed security identifier")),
        BinarySyntax::SecurityDescriptor => Ok(BASE64.encode(bytes)),
    }
}

/// Decode a binary SID (MS-DTYP 2.4.2) into `S-R-A-S1-...` form.
fn decode_sid(bytes: &[u8]) -> Option<String> {
    let revision = *bytes.first()?;
    let count = *bytes.get(1)? as usize;
    if bytes.len() != 8 + 4 * count {
        return None;
    }

    let authority = bytes[2..8]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

    let mut sid = format!("S-{revision}-{authority}");
    for chunk in bytes[8..].chunks_exact(4) {
        let sub = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        sid.push('-');
        sid.push_str(&sub.to_string());
    }
    Some(sid)
}

/// Parse a textual value according to its declared type.
pub fn coerce_scalar(
    name: &str,
    attribute_type: AttributeType,
    raw: &str,
) -> ConnectorResult<AttributeValue> {
    let invalid = |what: &str| {
        ConnectorError::invalid_attribute_type(name, format!("'{raw}' is not a valid {what}"))
    };
    let value = raw.trim();

    match attribute_type {
        AttributeType::String => Ok(AttributeValue::String(raw.to_string())),
        AttributeType::Bool => match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(AttributeValue::Boolean(true)),
            "false" | "0" => Ok(AttributeValue::Boolean(false)),
            _ => Err(invalid("boolean")),
        },
        AttributeType::Int64 => value
            .parse::<i64>()
            .map(AttributeValue::Integer)
            .map_err(|_| invalid("64-bit integer")),
        AttributeType::Double => value
            .parse::<f64>()
            .map(AttributeValue::Float)
            .map_err(|_| invalid("number")),
        AttributeType::Duration => parse_duration(value)
            .map(|d| AttributeValue::String(format_duration(d)))
            .ok_or_else(|| invalid("duration")),
        AttributeType::DateTime => parse_datetime(value)
            .map(|dt| match dt {
                Some(dt) => AttributeValue::String(dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                None => AttributeValue::Null,
            })
            .ok_or_else(|| invalid("date-time")),
    }
}

/// Parse a duration: an AD interval (100ns units, sign ignored), ISO 8601
/// `PnDTnHnMnS`, or `1h30m10s` style.
pub fn parse_duration(value: &str) -> Option<Duration> {
    if value.is_empty() {
        return None;
    }

    if let Ok(ticks) = value.parse::<i64>() {
        let ticks = ticks.unsigned_abs();
        return Some(Duration::new(
            ticks / 10_000_000,
            ((ticks % 10_000_000) * 100) as u32,
        ));
    }

    let upper = value.to_ascii_uppercase();
    if let Some(rest) = upper.strip_prefix('P') {
        let (date_part, time_part) = match rest.split_once('T') {
            Some((date, time)) => (date, Some(time)),
            None => (rest, None),
        };
        let mut total = sum_units(date_part, |unit| match unit {
            'W' => Some(7.0 * 86_400.0),
            'D' => Some(86_400.0),
            _ => None,
        })?;
        if let Some(time) = time_part {
            total += sum_units(time, |unit| match unit {
                'H' => Some(3_600.0),
                'M' => Some(60.0),
                'S' => Some(1.0),
                _ => None,
            })?;
        }
        return Duration::try_from_secs_f64(total).ok();
    }

    sum_units(&value.to_ascii_lowercase(), |unit| match unit {
        'd' => Some(86_400.0),
        'h' => Some(3_600.0),
        'm' => Some(60.0),
        's' => Some(1.0),
        _ => None,
    })
    .and_then(|total| Duration::try_from_secs_f64(total).ok())
}

/// Sum `<number><unit>` pairs; `None` on any malformed component.
fn sum_units(input: &str, unit_seconds: impl Fn(char) -> Option<f64>) -> Option<f64> {
    let mut total = 0.0;
    let mut number = String::new();
    let mut seen = false;

    for c in input.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            continue;
        }
        let multiplier = unit_seconds(c)?;
        let amount: f64 = number.parse().ok()?;
        total += amount * multiplier;
        number.clear();
        seen = true;
    }

    (number.is_empty() && (seen || input.is_empty())).then_some(total)
}

fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        format!("{}s", duration.as_secs_f64())
    }
}

/// Windows FILETIME epoch (1601-01-01) expressed in 100ns ticks before the
/// Unix epoch.
const FILETIME_UNIX_OFFSET: i64 = 116_444_736_000_000_000;

/// Parse a timestamp: Generalized Time, RFC 3339, or an AD FILETIME integer.
///
/// FILETIME `0` and `i64::MAX` mean "never" and yield `Some(None)`.
pub fn parse_datetime(value: &str) -> Option<Option<DateTime<Utc>>> {
    if let Ok(ticks) = value.parse::<i64>() {
        if ticks == 0 || ticks == i64::MAX {
            return Some(None);
        }
        let unix_ticks = ticks.checked_sub(FILETIME_UNIX_OFFSET)?;
        let secs = unix_ticks.div_euclid(10_000_000);
        let nanos = (unix_ticks.rem_euclid(10_000_000) * 100) as u32;
        return DateTime::<Utc>::from_timestamp(secs, nanos).map(Some);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(Some(dt.with_timezone(&Utc)));
    }

    parse_generalized_time(value).map(Some)
}

/// Generalized Time (RFC 4517 3.3.13): `YYYYMMDDHHMMSS[.f](Z|+hhmm|-hhmm)`.
fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let (body, offset_secs) = if let Some(body) = value.strip_suffix(['Z', 'z']) {
        (body, 0)
    } else {
        let split = value.len().checked_sub(5)?;
        let (body, zone) = (value.get(..split)?, value.get(split..)?);
        if !zone.is_ascii() {
            return None;
        }
        let sign = match zone.as_bytes()[0] {
            b'+' => 1,
            b'-' => -1,
            _ => return None,
        };
        let hours: i32 = zone[1..3].parse().ok()?;
        let minutes: i32 = zone[3..5].parse().ok()?;
        (body, sign * (hours * 3_600 + minutes * 60))
    };

    let (whole, fraction) = match body.split_once(['.', ',']) {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (body, None),
    };
    let naive = NaiveDateTime::parse_from_str(whole, "%Y%m%d%H%M%S").ok()?;

    let nanos = match fraction {
        Some(digits) if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) => {
            let padded: String = digits.chars().chain(std::iter::repeat('0')).take(9).collect();
            padded.parse::<u32>().ok()?
        }
        Some(_) => return None,
        None => 0,
    };

    let offset = FixedOffset::east_opt(offset_secs)?;
    let local = offset.from_local_datetime(&naive).single()?;
    local
        .with_timezone(&Utc)
        .checked_add_signed(chrono::Duration::nanoseconds(i64::from(nanos)))
}
