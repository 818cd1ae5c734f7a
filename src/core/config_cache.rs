//! Per-app configuration cache with ETag revalidation and stale fallback.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use scc::HashMap;
use tokio::sync::Mutex;

use crate::{
    core::{AppConfig, AppId, ProxyError},
    metrics,
    ports::{Clock, ConfigFetch, ControlPlane, ControlPlaneError},
};

/// Upper bound on how long a fetched config is trusted without revalidation.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// How long past expiry a cached config may still be served when the control
/// plane is unreachable.
pub const STALE_CACHE_FALLBACK: Duration = Duration::from_secs(60 * 60);

/// Result of [`ConfigCache::get_config`].
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Arc<AppConfig>,
    /// True when the config differs from the previously cached one, or on first load.
    pub modified: bool,
}

#[derive(Debug)]
struct CachedConfig {
    config: Option<Arc<AppConfig>>,
    expires_at: DateTime<Utc>,
    /// Outcome of the most recent control plane request, handed to callers
    /// that queued behind it.
    last_fetch: Option<Result<LoadedConfig, ProxyError>>,
}

#[derive(Debug)]
struct CacheSlot {
    /// Bumped under the lock each time a fetch completes.
    fetches: AtomicU64,
    state: Mutex<CachedConfig>,
}

pub struct ConfigCache {
    control_plane: Arc<dyn ControlPlane>,
    clock: Arc<dyn Clock>,
    entries: HashMap<AppId, Arc<CacheSlot>>,
}

impl ConfigCache {
    pub fn new(control_plane: Arc<dyn ControlPlane>, clock: Arc<dyn Clock>) -> Self {
        Self {
            control_plane,
            clock,
            entries: HashMap::new(),
        }
    }

    /// Returns the app's configuration, fetching or revalidating it when the
    /// cached copy has expired.
    ///
    /// Calls for the same app serialize on a per-app lock held across the
    /// fetch, so at most one request per app is in flight and every waiter
    /// observes its result.
    pub async fn get_config(&self, app_id: &AppId) -> Result<LoadedConfig, ProxyError> {
        let slot = self.entry(app_id).await;
        let seen = slot.fetches.load(Ordering::Acquire);
        let mut entry = slot.state.lock().await;

        if slot.fetches.load(Ordering::Acquire) != seen
            && let Some(result) = &entry.last_fetch
        {
            return result.clone();
        }

        let now = self.clock.now();
        if let Some(config) = &entry.config
            && now < entry.expires_at
        {
            metrics::increment_config_fetch("hit");
            return Ok(LoadedConfig {
                config: config.clone(),
                modified: false,
            });
        }

        let result = self.fetch(app_id, &mut entry, now).await;
        entry.last_fetch = Some(result.clone());
        slot.fetches.fetch_add(1, Ordering::Release);
        result
    }

    async fn fetch(
        &self,
        app_id: &AppId,
        entry: &mut CachedConfig,
        now: DateTime<Utc>,
    ) -> Result<LoadedConfig, ProxyError> {
        let etag = entry.config.as_ref().and_then(|c| c.etag.clone());
        match self.control_plane.get_app_config(app_id, etag.as_deref()).await {
            Ok(ConfigFetch::NotModified { max_age }) => {
                let Some(config) = entry.config.clone() else {
                    return Err(ProxyError::control_plane_unavailable(
                        app_id,
                        "control plane answered not modified without a cached config",
                    ));
                };
                metrics::increment_config_fetch("not_modified");
                entry.expires_at = now + effective_ttl(max_age);
                Ok(LoadedConfig {
                    config,
                    modified: false,
                })
            }
            Ok(ConfigFetch::Modified(mut config)) => {
                if config.id.is_empty() {
                    config.id = app_id.to_string();
                }
                entry.expires_at = now + effective_ttl(config.max_age);

                let modified = match &entry.config {
                    None => true,
                    Some(old) => match (&old.etag, &config.etag) {
                        (Some(old_etag), Some(new_etag)) => old_etag != new_etag,
                        _ => **old != config,
                    },
                };
                if !modified && let Some(old) = entry.config.clone() {
                    metrics::increment_config_fetch("not_modified");
                    return Ok(LoadedConfig {
                        config: old,
                        modified: false,
                    });
                }

                metrics::increment_config_fetch("modified");
                tracing::info!(app_id = %app_id, etag = ?config.etag, "Loaded app configuration");
                let config = Arc::new(config);
                entry.config = Some(config.clone());
                Ok(LoadedConfig {
                    config,
                    modified: true,
                })
            }
            Err(ControlPlaneError::NotFound { .. }) => {
                metrics::increment_config_fetch("not_found");
                Err(ProxyError::not_found(format!(
                    "Application \"{app_id}\" not found."
                )))
            }
            Err(err) => {
                if let Some(config) = &entry.config
                    && now < entry.expires_at + to_delta(STALE_CACHE_FALLBACK)
                {
                    metrics::increment_config_fetch("stale");
                    tracing::warn!(
                        app_id = %app_id,
                        error = %err,
                        "Using stale app configuration, control plane request failed"
                    );
                    return Ok(LoadedConfig {
                        config: config.clone(),
                        modified: false,
                    });
                }

                metrics::increment_config_fetch("error");
                tracing::error!(app_id = %app_id, error = %err, "Unable to load app configuration");
                Err(ProxyError::control_plane_unavailable(app_id, err.to_string()))
            }
        }
    }

    async fn entry(&self, app_id: &AppId) -> Arc<CacheSlot> {
        self.entries
            .entry_async(app_id.clone())
            .await
            .or_insert_with(|| {
                Arc::new(CacheSlot {
                    fetches: AtomicU64::new(0),
                    state: Mutex::new(CachedConfig {
                        config: None,
                        expires_at: DateTime::UNIX_EPOCH,
                        last_fetch: None,
                    }),
                })
            })
            .get()
            .clone()
    }
}

/// `min(max_age, MAX_CACHE_TTL)`.
pub fn effective_ttl(max_age: Duration) -> TimeDelta {
    to_delta(max_age.min(MAX_CACHE_TTL))
}

/// Extracts the cache lifetime from a `Cache-Control` header value.
/// `no-store`, `no-cache`, or a missing `max-age` mean zero.
pub fn parse_cache_control(value: &str) -> Duration {
    let mut max_age = None;
    for directive in value.split(',').map(str::trim) {
        let lower = directive.to_ascii_lowercase();
        if lower == "no-store" || lower == "no-cache" {
            return Duration::ZERO;
        }
        if let Some(seconds) = lower.strip_prefix("max-age=") {
            max_age = seconds.trim_matches('"').parse::<u64>().ok();
        }
    }
    max_age.map(Duration::from_secs).unwrap_or(Duration::ZERO)
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, testing::ScriptedControlPlane};

    fn config(name: &str, etag: &str, max_age: u64) -> AppConfig {
        AppConfig {
            id: String::new(),
            name: name.to_string(),
            project_id: "1".to_string(),
            upstream_app_url: "http://app.local".to_string(),
            auth_providers: vec![],
            auth_rules: vec![],
            etag: Some(etag.to_string()),
            max_age: Duration::from_secs(max_age),
        }
    }

    fn setup() -> (Arc<ScriptedControlPlane>, Arc<ManualClock>, ConfigCache) {
        let control_plane = Arc::new(ScriptedControlPlane::with_fetch_delay(
            Duration::from_millis(20),
        ));
        let clock = Arc::new(ManualClock::default());
        let cache = ConfigCache::new(control_plane.clone(), clock.clone());
        (control_plane, clock, cache)
    }

    #[test]
    fn test_parse_cache_control() {
        assert_eq!(parse_cache_control("max-age=30"), Duration::from_secs(30));
        assert_eq!(
            parse_cache_control("public, max-age=7200"),
            Duration::from_secs(7200)
        );
        assert_eq!(parse_cache_control("no-store"), Duration::ZERO);
        assert_eq!(parse_cache_control("max-age=30, no-cache"), Duration::ZERO);
        assert_eq!(parse_cache_control("private"), Duration::ZERO);
        assert_eq!(effective_ttl(Duration::from_secs(7200)), TimeDelta::hours(1));
    }

    #[tokio::test]
    async fn test_concurrent_cold_calls_fetch_once() {
        let (control_plane, _clock, cache) = setup();
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 60))));
        let cache = Arc::new(cache);
        let app = AppId::new("123");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let app = app.clone();
            handles.push(tokio::spawn(async move { cache.get_config(&app).await }));
        }
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(control_plane.fetch_calls(), 1);
        let first = &results[0].config;
        assert_eq!(first.id, "123");
        for result in &results {
            assert!(Arc::ptr_eq(first, &result.config));
        }
        // Everyone who waited on the load sees the same outcome.
        assert!(results.iter().all(|r| r.modified));

        // A later call reads the fresh entry.
        assert!(!cache.get_config(&app).await.unwrap().modified);
        assert_eq!(control_plane.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_a_failed_fetch() {
        let (control_plane, _clock, cache) = setup();
        control_plane.push_fetch(Err(ControlPlaneError::Transport("down".into())));
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 60))));
        let cache = Arc::new(cache);
        let app = AppId::new("123");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let app = app.clone();
            handles.push(tokio::spawn(async move { cache.get_config(&app).await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, ProxyError::ControlPlaneUnavailable { .. }));
        }
        assert_eq!(control_plane.fetch_calls(), 1);

        assert!(cache.get_config(&app).await.unwrap().modified);
        assert_eq!(control_plane.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_network() {
        let (control_plane, clock, cache) = setup();
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 60))));
        let app = AppId::new("123");

        assert!(cache.get_config(&app).await.unwrap().modified);
        clock.advance(TimeDelta::seconds(59));
        assert!(!cache.get_config(&app).await.unwrap().modified);
        assert_eq!(control_plane.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_revalidation_sends_etag_and_keeps_identity() {
        let (control_plane, clock, cache) = setup();
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 60))));
        control_plane.push_fetch(Ok(ConfigFetch::NotModified {
            max_age: Duration::from_secs(60),
        }));
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 60))));
        let app = AppId::new("123");

        let first = cache.get_config(&app).await.unwrap();
        clock.advance(TimeDelta::seconds(60));
        let second = cache.get_config(&app).await.unwrap();
        clock.advance(TimeDelta::seconds(60));
        let third = cache.get_config(&app).await.unwrap();

        assert_eq!(
            control_plane.sent_etags(),
            vec![None, Some("v1".to_string()), Some("v1".to_string())]
        );
        assert!(!second.modified);
        assert!(!third.modified);
        assert!(Arc::ptr_eq(&first.config, &second.config));
        assert!(Arc::ptr_eq(&first.config, &third.config));
    }

    #[tokio::test]
    async fn test_new_etag_is_modified() {
        let (control_plane, _clock, cache) = setup();
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 0))));
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("renamed", "v2", 0))));
        let app = AppId::new("123");

        cache.get_config(&app).await.unwrap();
        let second = cache.get_config(&app).await.unwrap();
        assert!(second.modified);
        assert_eq!(second.config.name, "renamed");
        // max-age 0 means every call revalidates.
        assert_eq!(control_plane.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_fallback_window() {
        let (control_plane, clock, cache) = setup();
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 60))));
        control_plane.push_fetch(Err(ControlPlaneError::Transport("down".into())));
        control_plane.push_fetch(Err(ControlPlaneError::Transport("down".into())));
        let app = AppId::new("123");

        let first = cache.get_config(&app).await.unwrap();
        // expires_at = start + 60s
        clock.advance(TimeDelta::seconds(60) + TimeDelta::hours(1) - TimeDelta::seconds(1));
        let stale = cache.get_config(&app).await.unwrap();
        assert!(!stale.modified);
        assert!(Arc::ptr_eq(&first.config, &stale.config));

        clock.advance(TimeDelta::seconds(2));
        let err = cache.get_config(&app).await.unwrap_err();
        assert!(matches!(err, ProxyError::ControlPlaneUnavailable { .. }));
        assert!(err.to_string().contains("123"));
    }

    #[tokio::test]
    async fn test_not_found_never_uses_stale_cache() {
        let (control_plane, clock, cache) = setup();
        control_plane.push_fetch(Ok(ConfigFetch::Modified(config("app", "v1", 60))));
        control_plane.push_fetch(Err(ControlPlaneError::NotFound {
            app_id: AppId::new("123"),
        }));
        let app = AppId::new("123");

        cache.get_config(&app).await.unwrap();
        clock.advance(TimeDelta::seconds(61));
        let err = cache.get_config(&app).await.unwrap_err();
        assert!(matches!(err, ProxyError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cold_failure_is_unavailable() {
        let (control_plane, _clock, cache) = setup();
        control_plane.push_fetch(Err(ControlPlaneError::Status {
            status: 500,
            body: "boom".into(),
        }));

        let err = cache.get_config(&AppId::new("123")).await.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
