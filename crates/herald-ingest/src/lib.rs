//! # herald-ingest
//!
//! Event ingestion adapters for Herald.
//!
//! Every adapter implements [`IngestAdapter`] and feeds the same
//! [`Dispatcher`](herald_core::Dispatcher), so delivery never depends on where
//! an event came from:
//!
//! - **HTTP** - Producers `POST` events to `/apps/{app_id}/events`
//! - **Redis** - Producers `PUBLISH` to `<prefix><channel>` on a Redis server
//!
//! ```rust,ignore
//! use herald_ingest::{HttpAdapter, IngestAdapter};
//!
//! async fn start(dispatcher: Arc<dyn Dispatcher>) -> Result<(), IngestError> {
//!     let http = HttpAdapter::new(false);
//!     http.subscribe(dispatcher).await?;
//!     let app = axum::Router::new().merge(http.routes());
//!     // serve `app`
//!     Ok(())
//! }
//! ```

pub mod traits;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "redis")]
pub mod redis;

pub use traits::{IngestAdapter, IngestError};

#[cfg(feature = "http")]
pub use http::HttpAdapter;

#[cfg(feature = "redis")]
pub use self::redis::{RedisAdapter, RedisAdapterConfig};
