//! Small shared helpers.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Cooperative cancellation poll; called at every suspension point.
pub(crate) fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Aborted.into());
    }
    Ok(())
}

/// Current time as seconds since the epoch.
pub(crate) fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_cancel() {
        let t = CancellationToken::new();
        assert!(check_cancel(&t).is_ok());
        t.cancel();
        let e = check_cancel(&t).unwrap_err();
        assert!(crate::is_aborted(&e));
    }
}
