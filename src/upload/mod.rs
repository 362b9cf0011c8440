//! Upload server and RTMP ingest-auth plumbing (spec §4.6–§4.10).

pub mod auth;
pub mod registry;
pub mod rtmp_auth;
pub mod server;
pub mod stream_store;
pub mod writer;
