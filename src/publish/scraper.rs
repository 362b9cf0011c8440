//! Source scrapers (spec §4.2). Each scraper turns a poll of some upstream
//! origin server into a list of currently-live streams; the publisher owns
//! the KV lifecycle, scrapers only report what they see right now.

use async_trait::async_trait;
use serde::Deserialize;

use crate::model::StreamDescriptor;

#[async_trait]
pub trait Scraper: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    /// Return every stream currently live on this origin.
    async fn scrape(&self) -> anyhow::Result<Vec<StreamDescriptor>>;
}

/// Scrapes an Icecast `status-json.xsl` endpoint.
pub struct IcecastScraper {
    name: String,
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
}

impl IcecastScraper {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, user: String, password: String) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            user,
            password,
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IcecastStats {
    icestats: IcecastIceStats,
}

#[derive(Debug, Deserialize)]
struct IcecastIceStats {
    #[serde(default)]
    source: SourceField,
}

/// Icecast emits `source` as a bare object when there's exactly one mount
/// and as an array when there's more than one.
#[derive(Debug, Default)]
struct SourceField(Vec<IcecastSource>);

impl<'de> Deserialize<'de> for SourceField {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let value = serde_json::Value::deserialize(deserializer)?;
        match value {
            serde_json::Value::Null => Ok(SourceField(Vec::new())),
            serde_json::Value::Array(_) => {
                let sources: Vec<IcecastSource> =
                    serde_json::from_value(value).map_err(D::Error::custom)?;
                Ok(SourceField(sources))
            }
            other => {
                let source: IcecastSource = serde_json::from_value(other).map_err(D::Error::custom)?;
                Ok(SourceField(vec![source]))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct IcecastSource {
    #[serde(rename = "listenurl")]
    listen_url: String,
}

#[async_trait]
impl Scraper for IcecastScraper {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scrape(&self) -> anyhow::Result<Vec<StreamDescriptor>> {
        let url = format!("{}/status-json.xsl", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?
            .error_for_status()?;
        let stats: IcecastStats = resp.json().await?;

        Ok(stats
            .icestats
            .source
            .0
            .into_iter()
            .map(|source| {
                let slug = source
                    .listen_url
                    .rsplit('/')
                    .next()
                    .unwrap_or(&source.listen_url)
                    .to_string();
                StreamDescriptor {
                    slug,
                    source: source.listen_url,
                    format: "matroska".to_string(),
                    published_at: 0,
                }
            })
            .collect())
    }
}
