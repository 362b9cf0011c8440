//! Live HLS playlist assembly (spec §4.4–4.6). Each upload of a variant
//! playlist is diffed against what this process already holds; genuinely
//! new segments are appended to a fixed-size sliding window, and a gap in
//! the uploaded tail (the encoder having restarted its own sequence)
//! becomes an `EXT-X-DISCONTINUITY` rather than a full playlist reset.

pub mod master;

use std::collections::{HashMap, VecDeque};

use m3u8_rs::{MasterPlaylist, MediaPlaylist, MediaSegment, Playlist};

use crate::error::UploadError;

/// Default sliding window size, in segments, kept live per variant.
pub const DEFAULT_WINDOW: usize = 6;

#[derive(Debug, Clone)]
enum Item {
    Segment(MediaSegment),
    Discontinuity,
}

/// Outcome of folding one uploaded variant playlist into its live window.
pub struct AppendResult {
    /// URIs of segments judged genuinely new and appended to the window.
    pub added: Vec<String>,
    /// URIs of segments pushed out of the window by this append, whose
    /// backing files no longer need to stay alive.
    pub evicted_segments: Vec<String>,
    pub discontinuity_inserted: bool,
}

/// One rendition's live window, tracked independently of the playlist file
/// bytes the encoder last uploaded (spec §4.4).
pub struct LivePlaylist {
    window: usize,
    target_duration: u64,
    media_sequence: u64,
    discontinuity_sequence: u64,
    items: VecDeque<Item>,
    /// Position, within the last uploaded source playlist's segment list,
    /// up to which segments have already been folded into the window.
    last_index: i64,
    /// Segment count of the last uploaded source playlist.
    last_size: i64,
    /// `EXT-X-MEDIA-SEQUENCE` of the last uploaded source playlist.
    last_sequence: i64,
}

impl LivePlaylist {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            target_duration: 0,
            media_sequence: 0,
            discontinuity_sequence: 0,
            items: VecDeque::new(),
            last_index: 0,
            last_size: 0,
            last_sequence: 0,
        }
    }

    /// Folds a freshly uploaded variant playlist into the live window,
    /// per spec §4.6.b (ported from `checkDiscontinuity`/`appendItems`):
    /// a source sequence that goes backwards means the encoder restarted
    /// and gets a discontinuity; otherwise a source that shrank without
    /// its sequence advancing just exposes a shorter tail, tracked by
    /// nudging `last_index` rather than re-appending segments already
    /// seen under a different index.
    pub fn append(&mut self, uploaded: &MediaPlaylist) -> AppendResult {
        self.target_duration = uploaded.target_duration;
        let mut evicted_segments = Vec::new();
        let mut discontinuity_inserted = false;

        let source_sequence = uploaded.media_sequence as i64;
        let source_size = uploaded.segments.len() as i64;

        if source_sequence < self.last_sequence {
            self.items.push_back(Item::Discontinuity);
            discontinuity_inserted = true;
            self.evict_to_window(&mut evicted_segments);
            self.last_index = 0;
        } else {
            let diff = self.last_sequence - source_sequence + source_size - self.last_size;
            if diff < 0 {
                self.last_index += diff;
            }
        }
        self.last_sequence = source_sequence;
        self.last_size = source_size;

        let mut added = Vec::new();
        for (index, segment) in uploaded.segments.iter().enumerate() {
            if index as i64 >= self.last_index {
                added.push(segment.uri.clone());
                self.items.push_back(Item::Segment(segment.clone()));
                self.evict_to_window(&mut evicted_segments);
            }
        }
        self.last_index = source_size;

        AppendResult { added, evicted_segments, discontinuity_inserted }
    }

    fn evict_to_window(&mut self, evicted_segments: &mut Vec<String>) {
        while self.items.len() > self.window {
            match self.items.pop_front() {
                Some(Item::Segment(seg)) => {
                    self.media_sequence += 1;
                    evicted_segments.push(seg.uri);
                }
                Some(Item::Discontinuity) => self.discontinuity_sequence += 1,
                None => break,
            }
        }
    }

    /// Renders the current window as a standard live media playlist.
    pub fn render(&self) -> MediaPlaylist {
        let mut segments = Vec::with_capacity(self.items.len());
        let mut pending_discontinuity = false;
        for item in &self.items {
            match item {
                Item::Discontinuity => pending_discontinuity = true,
                Item::Segment(seg) => {
                    let mut seg = seg.clone();
                    if pending_discontinuity {
                        seg.discontinuity = true;
                        pending_discontinuity = false;
                    }
                    segments.push(seg);
                }
            }
        }

        MediaPlaylist {
            version: Some(3),
            target_duration: self.target_duration,
            media_sequence: self.media_sequence,
            discontinuity_sequence: self.discontinuity_sequence,
            end_list: false,
            segments,
            ..Default::default()
        }
    }
}

/// What came out of parsing one uploaded `.m3u8` file.
pub enum Ingested {
    /// A master playlist, fixed up but otherwise stateless - the caller is
    /// responsible for writing it and its per-language variants.
    Master(MasterPlaylist),
    /// A variant playlist, already folded into its live window.
    Variant { rendered: MediaPlaylist, added: Vec<String>, evicted: Vec<String> },
}

/// Owns one live playlist per `(slug, variant)` key seen by the upload
/// server, so two streams uploading identically named variants never share
/// state.
#[derive(Default)]
pub struct StreamPlaylists {
    variants: HashMap<String, LivePlaylist>,
    window: usize,
}

impl StreamPlaylists {
    pub fn new(window: usize) -> Self {
        Self { variants: HashMap::new(), window }
    }

    /// Parses an uploaded playlist. Media (variant) playlists are folded
    /// into the window tracked under `key`; master playlists are returned
    /// for the caller to fix up and re-render (see `master`).
    pub fn ingest(&mut self, key: &str, slug: &str, variant: &str, bytes: &[u8]) -> Result<Ingested, UploadError> {
        let parsed = m3u8_rs::parse_playlist_res(bytes)
            .map_err(|err| UploadError::ParseFailure(err.to_string()))?;
        match parsed {
            Playlist::MasterPlaylist(master) => Ok(Ingested::Master(master)),
            Playlist::MediaPlaylist(media) => {
                let live = self.variants.entry(key.to_string()).or_insert_with(|| LivePlaylist::new(self.window));
                let result = live.append(&media);
                if result.discontinuity_inserted {
                    crate::metrics::HLS_DISCONTINUITIES.with_label_values(&[slug, variant]).inc();
                }
                Ok(Ingested::Variant {
                    rendered: live.render(),
                    added: result.added,
                    evicted: result.evicted_segments,
                })
            }
        }
    }
}
