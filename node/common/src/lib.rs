pub mod contracts;
pub mod crypto;
pub mod messages;
pub mod types;

pub use contracts::{EthLedger, Ledger, LedgerError, LedgerEvent, ObservedEvent};
pub use messages::{ClientMessage, Notification};
pub use types::*;

/// Sample repeated transient failures: log the first one and then every
/// power-of-two consecutive failure.
pub fn should_log_failure(consecutive_failures: u64) -> bool {
    consecutive_failures.is_power_of_two()
}
