//! # etcd-adapter: a uniform client layer over an etcd v3 style store
//!
//! etcd-adapter wraps a revisioned key-value store behind one operation
//! descriptor and one response shape. It provides:
//!
//! - **Operation descriptors**: a single [`OpOptions`] value for GET, PUT and
//!   DELETE, with prefix / range / key-only / count-only / revision options
//! - **Paging**: offset + limit windows over large ranges, read page by page
//!   at one pinned revision
//! - **Watch aggregation**: store batches split into per-action responses fed
//!   to a callback until cancelled
//! - **Leases**: grant, renew, revoke, time-to-live
//! - **Connection supervision**: readiness signal, reopen, periodic endpoint
//!   refresh from the member list
//!
//! Two backends implement [`store::KvStore`]: the etcd gRPC protocol
//! ([`store::grpc`]) and an in-process MVCC store ([`embedded`]).
//!
//! # Usage
//!
//! ```no_run
//! use etcd_adapter::{Client, ClientConfig, OpOptions};
//!
//! # async fn run() -> Result<(), etcd_adapter::ClientError> {
//! let client = Client::connect(ClientConfig::with_endpoints(["127.0.0.1:2379"])).await;
//! if let Some(err) = client.err() {
//!     return Err(err);
//! }
//! client.put(&OpOptions::put("/registry/a", "1")).await?;
//! let page = client
//!     .get(&OpOptions::get("/registry/").prefix().offset(0).limit(100))
//!     .await?;
//! println!("{} of {} keys", page.rows().len(), page.count);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod embedded;
pub mod op;
pub mod paging;
pub mod store;

// Re-export main types at crate root for convenience
pub use client::{BoxError, Client, ClientError, ClientResult, ConnectionState};
pub use config::{ClientConfig, ConfigError};
pub use embedded::{EmbeddedConnector, EmbeddedStore};
pub use op::{Action, CmpOptions, KeyValue, OpOptions, Response, SortOrder, DEFAULT_PAGE_COUNT};
pub use store::{KvStore, StoreError};
