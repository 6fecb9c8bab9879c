pub mod auth;
pub mod client;
#[cfg(test)]
pub mod test_server;

pub use auth::Credentials;
pub use client::{byte_range, ChunkBody, Connector, DavClient, DavConfig, DavFuture, WebDav};
