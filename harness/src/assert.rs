//! Assertion helpers for scenario bodies.

use std::fmt::Debug;

use crate::error::{HarnessError, HarnessResult};

/// Expects `result` to be a remote RPC error and returns its `(code, message)`.
///
/// Success becomes `HarnessError::Assertion`; any other error is passed through.
pub fn expect_rpc_error<T: Debug>(result: HarnessResult<T>) -> HarnessResult<(i64, String)> {
    match result {
        Ok(value) => Err(HarnessError::Assertion(format!(
            "expected an rpc error, got {value:?}"
        ))),
        Err(HarnessError::RemoteCall { code, message, .. }) => Ok((code, message)),
        Err(err) => Err(err),
    }
}

/// Like [`expect_rpc_error`], also checking the code and that the message
/// contains `needle`.
pub fn expect_rpc_error_matching<T: Debug>(
    result: HarnessResult<T>,
    code: i64,
    needle: &str,
) -> HarnessResult<()> {
    let (actual, message) = expect_rpc_error(result)?;
    if actual != code || !message.contains(needle) {
        return Err(HarnessError::Assertion(format!(
            "expected rpc error {code} containing {needle:?}, got {actual}: {message}"
        )));
    }
    Ok(())
}

pub fn ensure_eq<T: PartialEq + Debug>(left: T, right: T, what: &str) -> HarnessResult<()> {
    if left == right {
        Ok(())
    } else {
        Err(HarnessError::Assertion(format!(
            "{what}: {left:?} != {right:?}"
        )))
    }
}
