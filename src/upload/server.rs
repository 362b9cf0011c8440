//! Upload server HTTP surface (spec §4.6–§4.9): authenticate, then
//! dispatch by file extension - `.m3u8` goes through the playlist
//! assembler, image snapshots keep their directory alive, everything else
//! is a plain TTL-registered write.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::routing::any;
use axum::Router;
use base64::Engine;
use tokio::sync::Mutex;
use tracing::warn;

use crate::hls::{master, Ingested, StreamPlaylists};
use crate::upload::auth::StaticAuth;
use crate::upload::registry::{FileRegistry, DEFAULT_TTL};
use crate::upload::stream_store::StreamStore;
use crate::upload::writer::write_atomic;

/// Maximum accepted upload body, in bytes. Generous enough for an HLS
/// segment, tight enough to bound a malicious or misbehaving encoder.
pub const MAX_UPLOAD_BYTES: u64 = 64 * 1024 * 1024;

pub struct UploadServerState {
    pub auth: StaticAuth,
    pub stream_store: Arc<StreamStore>,
    pub registry: FileRegistry,
    pub playlists: Mutex<StreamPlaylists>,
    pub base_dir: PathBuf,
}

pub fn router(state: Arc<UploadServerState>) -> Router {
    Router::new()
        .route("/health", any(health))
        .fallback(any(handle_upload))
        .with_state(state)
}

async fn health() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn handle_upload(
    State(state): State<Arc<UploadServerState>>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if method == Method::DELETE {
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    if method != Method::PUT && method != Method::POST {
        return StatusCode::METHOD_NOT_ALLOWED;
    }

    let Some((user, pass)) = basic_credentials(&headers) else {
        return StatusCode::UNAUTHORIZED;
    };
    let path = uri.path();
    let Some((slug, relative)) = state.auth.authorize(&user, &pass, path) else {
        return StatusCode::FORBIDDEN;
    };

    let origin = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    if let Err(err) = state.stream_store.update_stream(&slug, &origin).await {
        warn!(%slug, %err, "upload rejected");
        return StatusCode::FORBIDDEN;
    }

    let disk_path = state.base_dir.join(&relative);

    match handle_file(&state, &slug, &disk_path, &body).await {
        Ok(()) => StatusCode::OK,
        Err(err) => {
            warn!(%slug, path = %disk_path.display(), %err, "upload failed");
            match err.downcast_ref::<crate::error::UploadError>() {
                Some(crate::error::UploadError::InvalidOrigin) => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
    }
}

async fn handle_file(
    state: &UploadServerState,
    slug: &str,
    disk_path: &Path,
    body: &[u8],
) -> anyhow::Result<()> {
    let extension = disk_path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match extension {
        "m3u8" => {
            let stream_dir = state.base_dir.join(slug);
            if disk_path.parent() != Some(stream_dir.as_path()) {
                anyhow::bail!(crate::error::UploadError::InvalidOrigin);
            }
            let variant = disk_path.file_stem().and_then(|s| s.to_str()).unwrap_or("index");
            let key = format!("{slug}/{variant}");
            match state.playlists.lock().await.ingest(&key, slug, variant, body)? {
                Ingested::Variant { rendered, added, evicted } => {
                    let bytes = serialize_media(&rendered)?;
                    write_atomic(disk_path, &bytes, MAX_UPLOAD_BYTES).await?;
                    state.registry.keep_alive(disk_path.to_path_buf()).await;
                    for segment in added {
                        state.registry.keep_alive(stream_dir.join(&segment)).await;
                    }
                    for segment in evicted {
                        state.registry.release(stream_dir.join(&segment)).await;
                    }
                }
                Ingested::Master(mut parsed) => {
                    master::fixup_codec_information(&mut parsed);
                    let base_bytes = serialize_master(&parsed)?;
                    write_atomic(disk_path, &base_bytes, MAX_UPLOAD_BYTES).await?;
                    state.registry.keep_alive(disk_path.to_path_buf()).await;
                    for (name, variant_master) in master::generate_language_masters(&parsed) {
                        let variant_bytes = serialize_master(&variant_master)?;
                        let variant_path = disk_path.with_file_name(format!("{name}.m3u8"));
                        write_atomic(&variant_path, &variant_bytes, MAX_UPLOAD_BYTES).await?;
                    }
                }
            }
            Ok(())
        }
        "jpg" | "jpeg" => {
            if let Some(dir) = disk_path.parent() {
                state.registry.keep_alive(dir.to_path_buf()).await;
            }
            write_atomic(disk_path, body, MAX_UPLOAD_BYTES).await?;
            Ok(())
        }
        _ => {
            write_atomic(disk_path, body, MAX_UPLOAD_BYTES).await?;
            state.registry.register_file(disk_path.to_path_buf(), DEFAULT_TTL).await;
            Ok(())
        }
    }
}

fn serialize_media(playlist: &m3u8_rs::MediaPlaylist) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    playlist.write_to(&mut buf)?;
    Ok(buf)
}

fn serialize_master(playlist: &m3u8_rs::MasterPlaylist) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    playlist.write_to(&mut buf)?;
    Ok(buf)
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::auth::{AuthConfig, AuthEntry};
    use tokio::sync::watch;
    use tower::ServiceExt;

    fn state(dir: &Path) -> Arc<UploadServerState> {
        let (_tx, rx) = watch::channel(false);
        Arc::new(UploadServerState {
            auth: StaticAuth::new(AuthConfig {
                allowed_dirs: vec![dir.to_string_lossy().to_string()],
                users: vec![AuthEntry { user: "hall1".into(), pass: "secret".into(), matches: "*".into() }],
            }),
            stream_store: StreamStore::spawn(rx.clone()),
            registry: FileRegistry::spawn(rx),
            playlists: Mutex::new(StreamPlaylists::new(6)),
            base_dir: dir.to_path_buf(),
        })
    }

    fn basic_auth_header(user: &str, pass: &str) -> String {
        let creds = format!("{user}:{pass}");
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(creds))
    }

    #[tokio::test]
    async fn put_without_auth_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri(format!("{}/hall1/segment1.ts", dir.path().display()))
                    .body(axum::body::Body::from("data"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn put_with_auth_writes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let uri = format!("{}/hall1/segment1.ts", dir.path().display());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri(&uri)
                    .header("authorization", basic_auth_header("hall1", "secret"))
                    .body(axum::body::Body::from("data"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(dir.path().join("hall1/segment1.ts").exists());
    }

    #[tokio::test]
    async fn delete_is_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("DELETE")
                    .uri(format!("{}/hall1/segment1.ts", dir.path().display()))
                    .header("authorization", basic_auth_header("hall1", "secret"))
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn playlist_upload_renders_and_serializes_the_output() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));

        let segment_uri = format!("{}/hall1/0.ts", dir.path().display());
        app.clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri(&segment_uri)
                    .header("authorization", basic_auth_header("hall1", "secret"))
                    .body(axum::body::Body::from("segment-bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();

        let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:4.0,\n0.ts\n";
        let playlist_uri = format!("{}/hall1/index.m3u8", dir.path().display());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri(&playlist_uri)
                    .header("authorization", basic_auth_header("hall1", "secret"))
                    .body(axum::body::Body::from(playlist))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let rendered = std::fs::read_to_string(dir.path().join("hall1/index.m3u8")).unwrap();
        assert!(rendered.starts_with("#EXTM3U"));
        assert!(rendered.contains("0.ts"));
    }

    #[tokio::test]
    async fn nested_playlist_path_is_rejected_as_cross_slug() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let uri = format!("{}/hall1/nested/index.m3u8", dir.path().display());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("PUT")
                    .uri(&uri)
                    .header("authorization", basic_auth_header("hall1", "secret"))
                    .body(axum::body::Body::from("#EXTM3U\n"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn health_check_does_not_require_auth() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(dir.path()));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("GET")
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
