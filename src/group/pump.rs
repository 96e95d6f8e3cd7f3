//! Scheduling loop: one tokio task per execution run.
//!
//! The loop suspends on the status manager's wait handle, wakes when a slot
//! frees up or work appears, and exits once no task remains (or the group is
//! disposed mid-run).

use std::sync::Arc;

use super::GroupInner;

pub(super) async fn run(inner: Arc<GroupInner>) {
    tracing::debug!(group = %inner.id, "pump started");
    loop {
        if inner.status.wait().await.is_err() {
            break;
        }
        if inner.status.reset_wait().is_err() {
            break;
        }
        let remaining = match inner.status.remaining() {
            Ok(n) => n,
            Err(_) => break,
        };
        if remaining == 0 {
            break;
        }
        if inner.is_cancelling() {
            // Let in-flight cancellations drain; completions re-signal.
            continue;
        }
        inner.schedule_next();
    }
    inner.finish_run();
}
