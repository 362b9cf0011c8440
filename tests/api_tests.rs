//! End-to-end upload server test: an authenticated multi-file upload
//! sequence (segment, then a playlist referencing it) exercised through
//! the full axum router via `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::Engine;
use streamd::hls::StreamPlaylists;
use streamd::upload::auth::{AuthConfig, AuthEntry, StaticAuth};
use streamd::upload::registry::FileRegistry;
use streamd::upload::server::{router, UploadServerState};
use streamd::upload::stream_store::StreamStore;
use tokio::sync::{watch, Mutex};
use tower::util::ServiceExt;

fn basic_auth(user: &str, pass: &str) -> String {
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}")))
}

fn build_state(dir: &std::path::Path) -> std::sync::Arc<UploadServerState> {
    let (_tx, rx) = watch::channel(false);
    std::sync::Arc::new(UploadServerState {
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

#[tokio::test]
async fn segment_then_playlist_upload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(build_state(dir.path()));

    let segment_uri = format!("{}/hall1/0.ts", dir.path().display());
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(&segment_uri)
                .header("authorization", basic_auth("hall1", "secret"))
                .body(Body::from("segment-bytes"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(dir.path().join("hall1/0.ts").exists());

    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:4.0,\n0.ts\n";
    let playlist_uri = format!("{}/hall1/index.m3u8", dir.path().display());
    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(&playlist_uri)
                .header("authorization", basic_auth("hall1", "secret"))
                .body(Body::from(playlist))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(dir.path().join("hall1/index.m3u8").exists());
}

#[tokio::test]
async fn wrong_credentials_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(build_state(dir.path()));
    let uri = format!("{}/hall1/0.ts", dir.path().display());

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(&uri)
                .header("authorization", basic_auth("hall1", "wrong-password"))
                .body(Body::from("x"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
