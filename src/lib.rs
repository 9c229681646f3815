//! # keepsake
//!
//! An HTTP-semantics-aware response cache for async Rust handlers.
//!
//! A [`CacheLayer`](cache::CacheLayer) wraps any [`Handler`](middleware::Handler)
//! and replays stored responses according to RFC 7234: `Cache-Control`
//! precedence, freshness and age, `Vary`, and shared versus private
//! semantics. Misses stream to the client while the body is captured for
//! storage in the background.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use keepsake::cache::{CacheEngine, CacheLayer, MemoryStore};
//! use keepsake::http::{Request, ResponseWriter};
//! use keepsake::middleware::{Handler, Logger};
//! use keepsake::server::Server;
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Handler for Hello {
//!     async fn serve(&self, _req: &Request, w: &mut dyn ResponseWriter) {
//!         w.headers_mut().set("Cache-Control", "max-age=60");
//!         let _ = w.write(b"Hello, World!").await;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(CacheEngine::new(MemoryStore::new()));
//!     let app = Logger::new(CacheLayer::new(engine, Hello));
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run(app).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod http;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::{CacheConfig, CacheEngine, CacheLayer, DiskStore, MemoryStore, Store};
pub use http::{Headers, Method, Request, Response, ResponseWriter, StatusCode};
pub use middleware::{Handler, Logger};
pub use server::{Server, ServerError};
