//! Fuzz target for directory value coercion.
//!
//! Raw attribute values of every declared type must coerce or fail with an
//! error, and binary syntaxes must never panic on short input.
//!
//! Run with:
//! cargo +nightly fuzz run fuzz_attribute_coercion -- -max_total_time=600

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use dirsync_connector::operation::AttributeType;
use dirsync_connector_ldap::coerce::{coerce_scalar, decode_binary, parse_datetime, parse_duration, BinarySyntax};

#[derive(Arbitrary, Debug)]
struct CoercionInput {
    raw: String,
    bytes: Vec<u8>,
    kind: u8,
}

fuzz_target!(|input: CoercionInput| {
    if input.raw.len() > 256 || input.bytes.len() > 1024 {
        return;
    }

    let attribute_type = match input.kind % 6 {
        0 => AttributeType::String,
        1 => AttributeType::Bool,
        2 => AttributeType::Int64,
        3 => AttributeType::Double,
        4 => AttributeType::Duration,
        _ => AttributeType::DateTime,
    };
    let _ = coerce_scalar("fuzzed", attribute_type, &input.raw);
    let _ = parse_duration(&input.raw);
    let _ = parse_datetime(&input.raw);

    for syntax in [BinarySyntax::Guid, BinarySyntax::Sid, BinarySyntax::SecurityDescriptor] {
        let _ = decode_binary("fuzzed", syntax, &input.bytes);
    }
});
