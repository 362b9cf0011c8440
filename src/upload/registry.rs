//! File lifecycle registry (spec §4.7): every uploaded file gets a TTL
//! unless something is actively holding it open (e.g. a directory
//! referenced by a live `.m3u8`), in which case it's exempt from expiry
//! until the hold is released, at which point it gets one more grace
//! period before deletion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often the registry scans for expired entries.
pub const EXPIRE_INTERVAL: Duration = Duration::from_secs(2);
/// Default TTL for a freshly uploaded file.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);
/// Grace period granted to a file once its hold is released.
pub const RELEASE_GRACE: Duration = Duration::from_secs(10);

enum Command {
    Register { path: PathBuf, ttl: Duration },
    KeepAlive { path: PathBuf },
    Release { path: PathBuf },
}

struct Entry {
    deadline: Option<Instant>,
    held: bool,
}

/// Handle to the registry's background actor task. Cheap to clone.
#[derive(Clone)]
pub struct FileRegistry {
    tx: mpsc::Sender<Command>,
}

impl FileRegistry {
    /// Spawns the actor task and returns a handle to it. The task runs
    /// until `shutdown` fires, at which point it removes every file it
    /// still tracks.
    pub fn spawn(shutdown: watch::Receiver<bool>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(rx, shutdown));
        Self { tx }
    }

    pub async fn register_file(&self, path: PathBuf, ttl: Duration) {
        let _ = self.tx.send(Command::Register { path, ttl }).await;
    }

    /// Marks `path` as held open, exempting it from expiry until released.
    pub async fn keep_alive(&self, path: PathBuf) {
        let _ = self.tx.send(Command::KeepAlive { path }).await;
    }

    pub async fn release(&self, path: PathBuf) {
        let _ = self.tx.send(Command::Release { path }).await;
    }
}

async fn run(mut rx: mpsc::Receiver<Command>, mut shutdown: watch::Receiver<bool>) {
    let mut entries: HashMap<PathBuf, Entry> = HashMap::new();
    let mut ticker = tokio::time::interval(EXPIRE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    cleanup(&entries).await;
                    return;
                }
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => apply(&mut entries, cmd),
                    None => { cleanup(&entries).await; return; }
                }
            }
            _ = ticker.tick() => expire(&mut entries).await,
        }
    }
}

fn apply(entries: &mut HashMap<PathBuf, Entry>, cmd: Command) {
    match cmd {
        Command::Register { path, ttl } => {
            if entries.get(&path).is_some_and(|e| e.held) {
                debug!(path = %path.display(), "refusing to override active hold with a ttl entry");
                return;
            }
            entries.insert(path, Entry { deadline: Some(Instant::now() + ttl), held: false });
        }
        Command::KeepAlive { path } => {
            entries.insert(path, Entry { deadline: None, held: true });
        }
        Command::Release { path } => {
            entries.insert(path, Entry { deadline: Some(Instant::now() + RELEASE_GRACE), held: false });
        }
    }
    report_size(entries);
}

async fn expire(entries: &mut HashMap<PathBuf, Entry>) {
    let now = Instant::now();
    let due: Vec<PathBuf> = entries
        .iter()
        .filter(|(_, e)| !e.held && e.deadline.is_some_and(|d| d <= now))
        .map(|(p, _)| p.clone())
        .collect();
    for path in due {
        entries.remove(&path);
        remove_file(&path).await;
    }
    report_size(entries);
}

fn report_size(entries: &HashMap<PathBuf, Entry>) {
    crate::metrics::REGISTRY_SIZE.with_label_values(&["default"]).set(entries.len() as i64);
}

async fn cleanup(entries: &HashMap<PathBuf, Entry>) {
    for path in entries.keys() {
        remove_file(path).await;
    }
}

async fn remove_file(path: &PathBuf) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "expired file removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "failed to remove expired file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn registered_file_is_removed_after_its_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.ts");
        std::fs::File::create(&path).unwrap().write_all(b"x").unwrap();

        let (_stop_tx, stop_rx) = watch::channel(false);
        let registry = FileRegistry::spawn(stop_rx);
        registry.register_file(path.clone(), Duration::from_millis(50)).await;

        tokio::time::sleep(Duration::from_millis(50 + EXPIRE_INTERVAL.as_millis() as u64 * 2)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn held_file_survives_past_its_would_be_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.m3u8");
        std::fs::File::create(&path).unwrap().write_all(b"x").unwrap();

        let (_stop_tx, stop_rx) = watch::channel(false);
        let registry = FileRegistry::spawn(stop_rx);
        registry.register_file(path.clone(), Duration::from_millis(10)).await;
        registry.keep_alive(path.clone()).await;

        tokio::time::sleep(Duration::from_millis(10 + EXPIRE_INTERVAL.as_millis() as u64 * 2)).await;
        assert!(path.exists());
    }
}
