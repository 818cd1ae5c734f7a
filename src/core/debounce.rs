//! Per-key "at most once per interval" gate.
use std::{future::Future, hash::Hash, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use scc::HashMap;
use tokio::sync::Mutex;

use crate::ports::Clock;

#[derive(Debug, Default)]
struct DebounceState {
    next_allowed_at: Option<DateTime<Utc>>,
}

/// Runs an operation for a key at most once per `interval`.
///
/// The map is only touched for lookup/insert; the per-key mutex is held
/// across the operation, so concurrent calls for one key serialize while
/// different keys never wait on each other. The gate advances before the
/// operation runs, so a failing operation is still attempted at most once
/// per interval.
pub struct KeyedDebouncer<K> {
    clock: Arc<dyn Clock>,
    interval: TimeDelta,
    states: HashMap<K, Arc<Mutex<DebounceState>>>,
}

impl<K> KeyedDebouncer<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            clock,
            interval: TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX),
            states: HashMap::new(),
        }
    }

    /// Runs `op` unless the key is inside its interval.
    /// Returns `Ok(true)` if `op` ran and succeeded, `Ok(false)` if debounced,
    /// and the error of `op` otherwise.
    pub async fn run<F, Fut, E>(&self, key: K, op: F) -> Result<bool, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let state = self.state(key).await;
        let mut state = state.lock().await;

        let now = self.clock.now();
        if let Some(next_allowed_at) = state.next_allowed_at
            && now < next_allowed_at
        {
            return Ok(false);
        }

        state.next_allowed_at = Some(now + self.interval);
        op().await?;
        Ok(true)
    }

    async fn state(&self, key: K) -> Arc<Mutex<DebounceState>> {
        self.states
            .entry_async(key)
            .await
            .or_insert_with(|| Arc::new(Mutex::new(DebounceState::default())))
            .get()
            .clone()
    }
}
