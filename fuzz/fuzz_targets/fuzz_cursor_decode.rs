//! Fuzz target for cursor decoding.
//!
//! Arbitrary tokens must decode to a cursor or an `InvalidCursor` error,
//! never panic. Decoded cursors must survive re-encoding.
//!
//! Run with:
//! cargo +nightly fuzz run fuzz_cursor_decode -- -max_total_time=600

#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::Value;

use dirsync_connector::cursor::{decode, encode, paginate, validate_cursor, CompositeCursor};
use dirsync_connector::error::ConnectorError;
use dirsync_connector_ldap::PageInfo;

fuzz_target!(|data: &[u8]| {
    let Ok(token) = std::str::from_utf8(data) else {
        return;
    };

    match decode::<Value>(Some(token)) {
        Ok(Some(cursor)) => {
            let _ = validate_cursor(Some(&cursor), "Person", false);
            let _ = validate_cursor(Some(&cursor), "GroupMember", true);

            let reencoded = encode(Some(&cursor)).unwrap();
            let again: Option<CompositeCursor<Value>> = decode(reencoded.as_deref()).unwrap();
            assert_eq!(again.as_ref(), Some(&cursor));

            let items = [1, 2, 3, 4, 5];
            let _ = paginate(&items, 2, cursor.cursor.as_ref());
        }
        Ok(None) => assert!(token.is_empty()),
        Err(e) => assert!(matches!(e, ConnectorError::InvalidCursor { .. })),
    }

    if let Ok(info) = PageInfo::decode(token) {
        assert!(info.next_member_processed >= 0);
        let again = PageInfo::decode(&info.encode().unwrap()).unwrap();
        assert_eq!(again, info);
    }
});
