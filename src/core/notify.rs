//! Tells the control plane an app received traffic.
use std::{sync::Arc, time::Duration};

use crate::{
    core::{AppId, debounce::KeyedDebouncer},
    metrics,
    ports::{AppPatch, Clock, ControlPlane, ControlPlaneError},
};

/// Sends `lastRequestTimestamp` for an app at most once per interval.
pub struct NotifyManager {
    control_plane: Arc<dyn ControlPlane>,
    clock: Arc<dyn Clock>,
    debouncer: KeyedDebouncer<AppId>,
}

impl NotifyManager {
    pub fn new(control_plane: Arc<dyn ControlPlane>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            control_plane,
            debouncer: KeyedDebouncer::new(clock.clone(), interval),
            clock,
        }
    }

    pub async fn notify(&self, app_id: &AppId) -> Result<(), ControlPlaneError> {
        let result = self
            .debouncer
            .run(app_id.clone(), || async {
                let patch = AppPatch::last_request(self.clock.now());
                self.control_plane.patch_app(app_id, &patch).await
            })
            .await;

        match &result {
            Ok(true) => {
                metrics::increment_notify("sent");
                tracing::debug!(app_id = %app_id, "Notified control plane about app usage");
            }
            Ok(false) => metrics::increment_notify("debounced"),
            Err(_) => metrics::increment_notify("error"),
        }
        result.map(|_| ())
    }
}
