//! Wire types shared between the KV store and every component (spec §3, §6).

use serde::{Deserialize, Serialize};

/// A scraped source, published by the publisher under `/stream/<slug>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub slug: String,
    pub source: String,
    pub format: String,
    #[serde(rename = "publishedAt", default)]
    pub published_at: i64,
}

/// A transcoder node's self-reported state, published under
/// `/service/transcode/<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscoderStatus {
    pub name: String,
    pub capacity: i64,
    #[serde(default)]
    pub streams: Vec<String>,
}

impl TranscoderStatus {
    pub fn active(&self) -> usize {
        self.streams.len()
    }

    /// Load ordering used by `ShouldClaim`: zero/negative capacity nodes are
    /// compared by raw active count, others by utilization ratio. Ties are
    /// broken by name so claim order is reproducible (spec §9 open question 4).
    pub fn load_cmp(&self, other: &TranscoderStatus) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let ordering = if self.capacity <= 0 || other.capacity <= 0 {
            self.active().cmp(&other.active())
        } else {
            let a = self.active() as f64 / self.capacity as f64;
            let b = other.active() as f64 / other.capacity as f64;
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        };
        ordering.then_with(|| self.name.cmp(&other.name))
    }
}

/// Ingest authorization settings for a slug, read from
/// `/streamSettings/<slug>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub slug: String,
    #[serde(rename = "ingestType")]
    pub ingest_type: String,
    pub secret: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub options: SettingsOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsOptions {
    #[serde(default)]
    pub passthrough: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_descriptor_json_roundtrip() {
        let d = StreamDescriptor {
            slug: "hall1".into(),
            source: "rtmp://x/live".into(),
            format: "matroska".into(),
            published_at: 1234,
        };
        let json = serde_json::to_string(&d).unwrap();
        let back: StreamDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn transcoder_status_json_roundtrip() {
        let s = TranscoderStatus {
            name: "node-a".into(),
            capacity: 4,
            streams: vec!["hall1".into(), "hall2".into()],
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: TranscoderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }

    #[test]
    fn load_cmp_zero_capacity_falls_back_to_count() {
        let a = TranscoderStatus { name: "a".into(), capacity: 0, streams: vec!["x".into()] };
        let b = TranscoderStatus { name: "b".into(), capacity: 0, streams: vec![] };
        assert_eq!(b.load_cmp(&a), std::cmp::Ordering::Less);
    }

    #[test]
    fn load_cmp_ties_break_on_name() {
        let a = TranscoderStatus { name: "b".into(), capacity: 2, streams: vec!["x".into()] };
        let b = TranscoderStatus { name: "a".into(), capacity: 2, streams: vec!["x".into()] };
        assert_eq!(a.load_cmp(&b), std::cmp::Ordering::Greater);
    }
}
