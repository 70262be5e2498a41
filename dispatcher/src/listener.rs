use nectar_common::{should_log_failure, Ledger, LedgerError};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::reconciler::Reconciler;

/// Largest block span requested in one log query
pub const MAX_BLOCK_RANGE: u64 = 2_000;

/// Polls the ledger for new events and feeds them to the reconciler in chain order
pub struct EventListener {
    ledger: Arc<dyn Ledger>,
    reconciler: Reconciler,
    poll_interval: Duration,
    /// First block not yet scanned
    next_block: u64,
    consecutive_failures: u64,
}

impl EventListener {
    /// Start at `start_block` when given (replaying history), otherwise just past
    /// the current head.
    pub async fn new(
        ledger: Arc<dyn Ledger>,
        reconciler: Reconciler,
        poll_interval: Duration,
        start_block: Option<u64>,
    ) -> Result<Self, LedgerError> {
        let next_block = match start_block {
            Some(block) => block,
            None => ledger.block_number().await? + 1,
        };

        info!("Event listener starting at block {}", next_block);

        Ok(Self {
            ledger,
            reconciler,
            poll_interval,
            next_block,
            consecutive_failures: 0,
        })
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    pub async fn run(mut self) {
        let mut poll_timer = interval(self.poll_interval);

        loop {
            poll_timer.tick().await;

            match self.poll_once().await {
                Ok(_) => {
                    if self.consecutive_failures > 0 {
                        info!("Ledger polling recovered after {} failure(s)", self.consecutive_failures);
                    }
                    self.consecutive_failures = 0;
                }
                Err(e) => {
                    self.consecutive_failures += 1;
                    if should_log_failure(self.consecutive_failures) {
                        warn!(
                            "Error polling ledger events ({} consecutive): {}",
                            self.consecutive_failures, e
                        );
                    }
                }
            }
        }
    }

    /// Scan from the cursor up to the current head. Returns the number of events applied.
    ///
    /// The cursor only advances past a range once every event in it was handled. When
    /// an event hits a transient ledger failure the cursor stops at its block, and the
    /// next poll replays that block; handling is idempotent.
    pub async fn poll_once(&mut self) -> Result<usize, LedgerError> {
        let head = self.ledger.block_number().await?;
        let mut applied = 0;

        while self.next_block <= head {
            let from_block = self.next_block;
            let to_block = head.min(from_block.saturating_add(MAX_BLOCK_RANGE - 1));

            debug!("Polling blocks {}..={}", from_block, to_block);
            let events = self.ledger.events(from_block, to_block).await?;

            for observed in &events {
                debug!("{} in block {}", observed.event.name(), observed.block_number);
                if let Err(e) = self.reconciler.handle(observed).await {
                    self.next_block = observed.block_number.max(from_block);
                    return Err(e);
                }
                applied += 1;
            }

            self.next_block = to_block + 1;
        }

        Ok(applied)
    }
}
