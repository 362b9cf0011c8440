//! RTMP `on_publish` callback endpoint (spec §4.10): the RTMP server posts
//! `app`/`name`/`auth` as a form on every publish attempt, and this handler
//! answers 200 or 401 by checking the app type and secret against the
//! slug's published `Settings`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::kv::{KvStore, UpdateKind};
use crate::model::Settings;

const SETTINGS_PREFIX: &str = "/streamSettings/";

/// Keeps an up-to-date view of every slug's ingest settings by watching
/// `/streamSettings/` (spec §4.10 depends on §4.1's watch semantics).
pub struct SettingsWatcher {
    settings: RwLock<HashMap<String, Settings>>,
}

impl SettingsWatcher {
    pub fn new() -> Self {
        Self { settings: RwLock::new(HashMap::new()) }
    }

    /// Runs the watch loop until the KV store's stream closes.
    pub async fn run(self: Arc<Self>, kv: Arc<dyn KvStore>) {
        let mut watch = kv.watch(SETTINGS_PREFIX);
        while let Some(updates) = watch.next().await {
            let mut settings = self.settings.write().await;
            for update in updates {
                let slug = update.key.trim_start_matches(SETTINGS_PREFIX).to_string();
                match update.kind {
                    UpdateKind::Put => match serde_json::from_slice::<Settings>(&update.value) {
                        Ok(s) => {
                            settings.insert(slug, s);
                        }
                        Err(err) => warn!(%err, "malformed stream settings"),
                    },
                    UpdateKind::Delete => {
                        settings.remove(&slug);
                    }
                }
            }
        }
    }

    /// Checks the publish attempt's `app` against the slug's configured
    /// ingest type and its secret, constant-time (spec §6: `app ==
    /// settings.ingestType AND auth == settings.secret`).
    pub async fn authorize(&self, slug: &str, app: &str, secret: &str) -> bool {
        let settings = self.settings.read().await;
        match settings.get(slug) {
            Some(s) => {
                s.ingest_type == app
                    && crate::upload::auth::constant_time_eq(s.secret.as_bytes(), secret.as_bytes())
            }
            None => false,
        }
    }
}

impl Default for SettingsWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
pub struct PublishForm {
    #[serde(default)]
    pub call: String,
    pub app: String,
    pub name: String,
    #[serde(default)]
    pub auth: String,
}

pub async fn on_publish(
    State(watcher): State<Arc<SettingsWatcher>>,
    Form(form): Form<PublishForm>,
) -> StatusCode {
    if watcher.authorize(&form.name, &form.app, &form.auth).await {
        debug!(app = %form.app, name = %form.name, "rtmp publish authorized");
        StatusCode::OK
    } else {
        debug!(app = %form.app, name = %form.name, "rtmp publish rejected");
        StatusCode::UNAUTHORIZED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory::MemoryKv;
    use std::time::Duration;

    #[tokio::test]
    async fn authorize_matches_published_secret() {
        let kv = MemoryKv::new();
        let client = Arc::new(kv.client(Duration::from_secs(10), Duration::from_secs(5)));
        let settings = Settings {
            slug: "hall1".into(),
            ingest_type: "rtmp".into(),
            secret: "shh".into(),
            public: true,
            options: Default::default(),
        };
        client
            .put("/streamSettings/hall1", serde_json::to_vec(&settings).unwrap())
            .await
            .unwrap();

        let watcher = Arc::new(SettingsWatcher::new());
        let watcher_kv: Arc<dyn KvStore> = client.clone();
        let watch_handle = tokio::spawn(watcher.clone().run(watcher_kv));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        watch_handle.abort();

        assert!(watcher.authorize("hall1", "rtmp", "shh").await);
        assert!(!watcher.authorize("hall1", "rtmp", "wrong").await);
        assert!(!watcher.authorize("hall1", "wrong-app", "shh").await);
    }
}
