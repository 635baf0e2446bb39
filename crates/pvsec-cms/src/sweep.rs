//! Background lifecycle sweep
//!
//! Moves PENDING certificates into VALID when their window opens and retires
//! anything past its window to EXPIRED, publishing every transition.  The
//! period is configured but never exceeds 30 seconds.

use std::sync::Arc;

use tokio::sync::watch;

use crate::service::Cms;

/// Run sweep rounds until the shutdown flag flips
pub async fn run(cms: Arc<Cms>, mut shutdown: watch::Receiver<bool>) {
    let period = cms.sweep_period();
    let mut ticker = tokio::time::interval(period);
    tracing::info!(period_secs = period.as_secs(), "lifecycle sweep started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cms = cms.clone();
                // Database work happens off the async executor
                let result = tokio::task::spawn_blocking(move || cms.sweep_once()).await;
                match result {
                    Ok(Ok(0)) => {}
                    Ok(Ok(changed)) => {
                        tracing::debug!(changed, "sweep applied transitions");
                    }
                    Ok(Err(e)) => {
                        tracing::error!(error = %e, "sweep round failed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "sweep task panicked");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("lifecycle sweep stopped");
                    return;
                }
            }
        }
    }
}
