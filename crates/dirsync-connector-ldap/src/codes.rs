//! LDAP result code to transport status mapping.

use std::sync::Once;

static UNMAPPED_RESULT_CODE: Once = Once::new();

/// Map an LDAP result code (RFC 4511 section 4.1.9) to a transport status.
pub fn status_from_result_code(code: u32) -> u16 {
    match code {
        0 => 200,                   // success
        1 => 500,                   // operationsError
        2 => 400,                   // protocolError
        3 => 504,                   // timeLimitExceeded
        4 => 400,                   // sizeLimitExceeded
        7 | 8 | 48 | 49 => 401,     // auth method, strong auth, inappropriate auth, credentials
        10 => 400,                  // referral
        11 => 429,                  // adminLimitExceeded
        12 => 400,                  // unavailableCriticalExtension
        32 => 404,                  // noSuchObject
        34 => 400,                  // invalidDNSyntax
        50 => 403,                  // insufficientAccessRights
        51 | 52 => 503,             // busy, unavailable
        53 => 400,                  // unwillingToPerform
        80 => 500,                  // other
        81 => 503,                  // serverDown
        85 => 504,                  // timeout
        87 => 400,                  // filterError
        _ => {
            UNMAPPED_RESULT_CODE.call_once(|| {
                tracing::warn!(
                    result_code = code,
                    "Unmapped LDAP result code, reporting internal error"
                );
            });
            500
        }
    }
}
