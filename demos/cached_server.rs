//! A small origin behind the cache.
//!
//! ```text
//! cargo run --example cached_server
//! curl -i http://127.0.0.1:8080/time      # X-Cache: SKIP, then HIT for 10s
//! curl -i http://127.0.0.1:8080/private   # never stored by a shared cache
//! ```
//!
//! Set `KEEPSAKE_CONFIG` to a JSON file with [`CacheConfig`] fields, and
//! `KEEPSAKE_CACHE_DIR` to persist entries on disk instead of in memory.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use keepsake::cache::{CacheConfig, CacheEngine, CacheLayer, DiskStore, MemoryStore, Store};
use keepsake::http::{Request, ResponseWriter, write_error};
use keepsake::middleware::{Handler, Logger};
use keepsake::server::Server;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Origin;

#[async_trait]
impl Handler for Origin {
    async fn serve(&self, req: &Request, w: &mut dyn ResponseWriter) {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        let body = match req.path() {
            "/time" => {
                w.headers_mut().set("Cache-Control", "max-age=10");
                format!("generated at {secs}\n")
            }
            "/private" => {
                w.headers_mut().set("Cache-Control", "private, max-age=60");
                format!("just for you at {secs}\n")
            }
            "/negotiate" => {
                w.headers_mut().set("Cache-Control", "max-age=30");
                w.headers_mut().set("Vary", "Accept");
                let accept = req.headers().get("accept").unwrap_or("*/*");
                format!("you accept {accept}\n")
            }
            _ => {
                let _ = write_error(w, 404, "not found").await;
                return;
            }
        };

        w.headers_mut().set("Content-Type", "text/plain");
        w.write_header(200);
        let _ = w.write(body.as_bytes()).await;
    }
}

fn load_config() -> Result<CacheConfig, Box<dyn std::error::Error>> {
    match std::env::var("KEEPSAKE_CONFIG") {
        Ok(path) => Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?),
        Err(_) => Ok(CacheConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keepsake=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    let store: Arc<dyn Store> = match std::env::var("KEEPSAKE_CACHE_DIR") {
        Ok(dir) => Arc::new(DiskStore::open(dir).await?),
        Err(_) => Arc::new(MemoryStore::new()),
    };
    let engine = Arc::new(CacheEngine::from_shared_store(store, config));

    let app = Logger::new(CacheLayer::new(Arc::clone(&engine), Origin));
    let server = Server::bind("127.0.0.1:8080").await?;
    println!("Listening on http://{}", server.local_addr());

    server
        .run_until(app, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if !engine.drain(Duration::from_secs(5)).await {
        eprintln!("some cache writes did not finish");
    }
    Ok(())
}
