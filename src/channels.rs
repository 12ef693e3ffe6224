//! Send helpers shared by the stages.
//!
//! Article and image channels are consumed by workers that stop on
//! termination, so sends to them must give up once the run is terminated.
//! Result and error channels are drained until their last sender drops; a
//! plain blocking send on them always completes.

use crate::models::ErrorRecord;
use crate::shutdown::ShutdownSignal;
use crate::stats::PipelineStats;
use crossbeam_channel::{SendTimeoutError, Sender};
use std::time::Duration;
use tracing::warn;

/// Blocks until `item` is sent. Hands the item back if the run terminates or
/// every receiver is gone first.
pub fn send_until_terminated<T>(
    tx: &Sender<T>,
    item: T,
    signal: &ShutdownSignal,
    poll_interval: Duration,
) -> Result<(), T> {
    let mut item = item;
    loop {
        match tx.send_timeout(item, poll_interval) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(back)) => {
                if signal.is_terminated() {
                    return Err(back);
                }
                item = back;
            }
            Err(SendTimeoutError::Disconnected(back)) => return Err(back),
        }
    }
}

/// Queues an error record for the error writer, keeping the pending count exact.
pub fn emit_error(tx: &Sender<ErrorRecord>, record: ErrorRecord, stats: &PipelineStats) {
    stats.pending_errors.add();
    if let Err(e) = tx.send(record) {
        stats.pending_errors.done();
        warn!(record = %e.into_inner(), "Error channel closed, record dropped");
    }
}
