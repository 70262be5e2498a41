use anyhow::{bail, Context, Result};
use nectar_common::LedgerError;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Retry configuration for startup checks
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
        }
    }
}

/// Execute async operation with exponential backoff retry
pub async fn retry_with_backoff<F, Fut, T>(operation: F, config: &RetryConfig) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt >= config.max_attempts => {
                return Err(e).context(format!("failed after {} attempts", attempt));
            }
            Err(e) => {
                if !is_retryable_error(&e) {
                    return Err(e);
                }

                warn!("Attempt {} failed, retrying in {}ms: {:#}", attempt, delay_ms, e);
                sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms as f64 * config.exponential_base) as u64;
                delay_ms = delay_ms.min(config.max_delay_ms);
            }
        }
    }
}

/// Transport problems are worth another attempt, bad input is not
fn is_retryable_error(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<LedgerError>() {
        Some(e) => e.is_transient(),
        None => {
            let msg = err.to_string();
            !(msg.contains("revert") || msg.contains("invalid"))
        }
    }
}

/// Validate a 0x-prefixed 20-byte hex address
pub fn validate_address(addr: &str) -> Result<()> {
    if !addr.starts_with("0x") {
        bail!("address must start with 0x");
    }

    if addr.len() != 42 {
        bail!("address must be 42 characters");
    }

    if !addr[2..].chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("address must be valid hex");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            exponential_base: 2.0,
        }
    }

    #[tokio::test]
    async fn retries_provider_errors_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_with_backoff(
            move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LedgerError::Provider("connection refused".into()).into())
                } else {
                    Ok(7u64)
                }
            },
            &fast(),
        )
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_on_non_retryable_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u64> = retry_with_backoff(
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::InvalidJobId("x".into()).into())
            },
            &fast(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn address_validation() {
        assert!(validate_address("0x5FbDB2315678afecb367f032d93F642f64180aa3").is_ok());
        assert!(validate_address("5FbDB2315678afecb367f032d93F642f64180aa3").is_err());
        assert!(validate_address("0x5FbDB2315678afecb367f032d93F642f64180aa").is_err());
        assert!(validate_address("0xZZbDB2315678afecb367f032d93F642f64180aa3").is_err());
    }
}
