//! Close signal shared by an open port's handles

use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SerialProxyError};

/// Cancelled once when the port closes; pending I/O selects against it
pub(crate) struct CloseSignal {
    token: CancellationToken,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Mark the port closed and wake every pending operation
    pub(crate) fn fire(&self) {
        self.token.cancel();
    }

    /// Run `io`, failing with `PortNotOpened` if the port closes first
    pub(crate) async fn guard<T>(
        &self,
        port: &str,
        operation: &'static str,
        io: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SerialProxyError::PortNotOpened {
                port: port.to_string(),
                operation,
            }),
            result = io => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fire_releases_pending_guard() {
        let signal = Arc::new(CloseSignal::new());
        let pending = {
            let signal = signal.clone();
            tokio::spawn(async move {
                signal
                    .guard("tty0", "read_bytes", std::future::pending::<Result<()>>())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.fire();
        let err = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.error_code(), "PORT_NOT_OPENED");
    }

    #[tokio::test]
    async fn test_guard_after_fire_fails_fast() {
        let signal = CloseSignal::new();
        signal.fire();
        let err = signal
            .guard("tty0", "write_bytes", async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PORT_NOT_OPENED");
    }

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let signal = CloseSignal::new();
        assert_eq!(signal.guard("tty0", "read_bytes", async { Ok(7) }).await.unwrap(), 7);
    }
}
