//! In-memory control plane used by unit tests.
use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use super::control_plane::{AppPatch, ConfigFetch, ControlPlane, ControlPlaneError};
use crate::core::AppId;

#[derive(Default)]
pub struct ScriptedControlPlane {
    fetches: Mutex<VecDeque<Result<ConfigFetch, ControlPlaneError>>>,
    patch_results: Mutex<VecDeque<Result<(), ControlPlaneError>>>,
    fetch_calls: AtomicUsize,
    sent_etags: Mutex<Vec<Option<String>>>,
    patches: Mutex<Vec<(AppId, AppPatch)>>,
    fetch_delay: Option<Duration>,
}

impl ScriptedControlPlane {
    pub fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn push_fetch(&self, result: Result<ConfigFetch, ControlPlaneError>) {
        self.fetches.lock().unwrap().push_back(result);
    }

    pub fn push_patch_result(&self, result: Result<(), ControlPlaneError>) {
        self.patch_results.lock().unwrap().push_back(result);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn sent_etags(&self) -> Vec<Option<String>> {
        self.sent_etags.lock().unwrap().clone()
    }

    pub fn patches(&self) -> Vec<(AppId, AppPatch)> {
        self.patches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for ScriptedControlPlane {
    async fn get_app_config(
        &self,
        _app_id: &AppId,
        etag: Option<&str>,
    ) -> Result<ConfigFetch, ControlPlaneError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.sent_etags
            .lock()
            .unwrap()
            .push(etag.map(str::to_string));
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ControlPlaneError::Transport("no scripted response".into())))
    }

    async fn patch_app(&self, app_id: &AppId, patch: &AppPatch) -> Result<(), ControlPlaneError> {
        self.patches
            .lock()
            .unwrap()
            .push((app_id.clone(), patch.clone()));
        self.patch_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}
