use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::HarvestError;
use crate::harvester::{Harvester, StopReason};

/// How long to wait after a successful cycle and after a failed one.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub poll_interval: Duration,
    pub retry_backoff: Duration,
}

/// Runs cycles until cancelled or a fatal error occurs.
///
/// Non-fatal cycle errors are logged and retried after `retry_backoff`; the
/// checkpoint guarantees the retry resumes at the failed sequence id.
pub async fn run_forever(
    harvester: &Harvester,
    schedule: Schedule,
    cancel: CancellationToken,
) -> Result<(), HarvestError> {
    let mut cycles = 0u64;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        cycles += 1;

        let pause = match harvester.run_cycle(&cancel).await {
            Ok(report) => {
                if report.stop == StopReason::Cancelled {
                    break;
                }
                schedule.poll_interval
            }
            Err(e) if e.is_fatal() => {
                error!("{} harvester stopping after cycle {}: {}", harvester.source_id(), cycles, e);
                return Err(e);
            }
            Err(e) => {
                let sequence = e.sequence();
                let e = anyhow::Error::new(e);
                warn!(?sequence, "cycle {} aborted: {:#}", cycles, e);
                schedule.retry_backoff
            }
        };

        info!("next cycle in {}s", pause.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => break,
        }
    }

    info!("scheduler stopped after {} cycles", cycles);
    Ok(())
}
