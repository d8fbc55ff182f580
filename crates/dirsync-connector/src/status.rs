//! Transport status mapping for tunneled requests.
//!
//! Tunnel RPC status codes are folded into the same HTTP-like status space
//! that directory result codes map into, so callers see one shape.

use std::sync::Once;
use tonic::Code;

static UNKNOWN_RPC_CODE: Once = Once::new();

/// Map a tunnel RPC status code to a transport status code.
pub fn status_from_rpc_code(code: Code) -> u16 {
    match code {
        Code::Ok => 200,
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => 400,
        Code::Unauthenticated => 401,
        Code::PermissionDenied => 403,
        Code::NotFound => 404,
        Code::AlreadyExists | Code::Aborted => 409,
        Code::ResourceExhausted => 429,
        Code::Cancelled => 499,
        Code::Internal | Code::DataLoss => 500,
        Code::Unimplemented => 501,
        Code::Unavailable => 503,
        Code::DeadlineExceeded => 504,
        Code::Unknown => {
            UNKNOWN_RPC_CODE.call_once(|| {
                tracing::warn!(
                    rpc_code = ?code,
                    "Unmapped tunnel status code, reporting internal error"
                );
            });
            500
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_code_mapping() {
        assert_eq!(status_from_rpc_code(Code::Ok), 200);
        assert_eq!(status_from_rpc_code(Code::InvalidArgument), 400);
        assert_eq!(status_from_rpc_code(Code::Unauthenticated), 401);
        assert_eq!(status_from_rpc_code(Code::PermissionDenied), 403);
        assert_eq!(status_from_rpc_code(Code::NotFound), 404);
        assert_eq!(status_from_rpc_code(Code::ResourceExhausted), 429);
        assert_eq!(status_from_rpc_code(Code::Unavailable), 503);
        assert_eq!(status_from_rpc_code(Code::DeadlineExceeded), 504);
    }

    #[test]
    fn test_unknown_code_defaults_to_internal() {
        assert_eq!(status_from_rpc_code(Code::Unknown), 500);
        // Second call takes the same path without logging again.
        assert_eq!(status_from_rpc_code(Code::Unknown), 500);
    }
}
