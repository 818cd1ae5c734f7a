//! Asks the control plane to start a sleeping app.
use std::{sync::Arc, time::Duration};

use crate::{
    core::{AppId, debounce::KeyedDebouncer},
    metrics,
    ports::{AppPatch, Clock, ControlPlane, ControlPlaneError},
};

/// The control plane answers 409 while the app is already changing state.
const CONFLICT: u16 = 409;

/// Sends `desiredState: running` for an app at most once per interval.
pub struct WakeupManager {
    control_plane: Arc<dyn ControlPlane>,
    debouncer: KeyedDebouncer<AppId>,
}

impl WakeupManager {
    pub fn new(control_plane: Arc<dyn ControlPlane>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            control_plane,
            debouncer: KeyedDebouncer::new(clock, interval),
        }
    }

    pub async fn wakeup(&self, app_id: &AppId) -> Result<(), ControlPlaneError> {
        let result = self
            .debouncer
            .run(app_id.clone(), || async {
                match self.control_plane.patch_app(app_id, &AppPatch::running()).await {
                    Err(ControlPlaneError::Status { status, .. }) if status == CONFLICT => {
                        metrics::increment_wakeup("conflict");
                        tracing::debug!(app_id = %app_id, "App is already changing state");
                        Ok(())
                    }
                    other => other,
                }
            })
            .await;

        match &result {
            Ok(true) => {
                metrics::increment_wakeup("sent");
                tracing::info!(app_id = %app_id, "Requested app wakeup");
            }
            Ok(false) => metrics::increment_wakeup("debounced"),
            Err(_) => metrics::increment_wakeup("error"),
        }
        result.map(|_| ())
    }
}
