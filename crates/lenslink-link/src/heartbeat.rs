use std::sync::Arc;
use std::time::Duration;

use lenslink_core::codec::build_heartbeat;
use lenslink_core::Arm;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::writer::LinkWriter;

/// Starts the liveness loop of a ready link. The first heartbeat goes out one
/// interval after the link became ready. Failures are logged only; the loop
/// ends when the writer is closed or the task is aborted.
pub(crate) fn spawn_heartbeat(arm: Arm, writer: Arc<LinkWriter>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u8 = 0;

        loop {
            ticker.tick().await;
            if writer.is_closed() {
                break;
            }
            if writer.write(build_heartbeat(seq)).await {
                debug!("Link[{}] heartbeat seq={}", arm.tag(), seq);
            } else {
                warn!("Link[{}] heartbeat seq={} not acknowledged", arm.tag(), seq);
            }
            seq = seq.wrapping_add(1);
        }
        debug!("Link[{}] heartbeat stopped", arm.tag());
    })
}
