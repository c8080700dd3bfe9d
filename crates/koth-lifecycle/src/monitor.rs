//! Background status reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::controller::LifecycleController;

/// Cadence of status refreshes.
pub const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Keep recorded container power states fresh until shutdown.
pub async fn run_status_monitor(
    controller: Arc<LifecycleController>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = STATUS_REFRESH_INTERVAL.as_secs(),
        "container status monitor started"
    );
    if let Err(e) = controller.refresh_statuses(None).await {
        warn!(error = %e, "initial container refresh failed");
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(STATUS_REFRESH_INTERVAL) => {
                if let Err(e) = controller.refresh_statuses(None).await {
                    warn!(error = %e, "container refresh failed");
                }
            }
            _ = shutdown.changed() => {
                info!("container status monitor shutting down");
                return;
            }
        }
    }
}
