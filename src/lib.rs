// SPDX-License-Identifier: MIT OR Apache-2.0

//! MongoDB storage adapter for the Rivulet realtime document server.
//!
//! Rivulet serializes operational-transformation (OT) ops against named
//! documents; this crate persists the resulting snapshots and op logs on
//! MongoDB and evaluates store-native queries safely.
//!
//! Each logical collection `C` maps to the store collection `C` for document
//! snapshots and `o_C` for its op log. A commit writes the op first, then
//! advances the snapshot with a compare-and-set on `(_id, _v)`, so concurrent
//! writers serialize per document and the op log stays the canonical history.
//! Ops form a reverse linked list through their `o` field; readers recover a
//! document's history by walking the chain rooted at the snapshot's op link,
//! which makes orphan rows left behind by lost commit races invisible.
//!
//! Queries are MongoDB query documents extended with `$`-prefixed adapter
//! operators; the filter portion passes through to the store unchanged apart
//! from a rewrite that keeps logically-deleted documents out of results.
//! Query-poll traffic can be directed at a separate, possibly lagging store
//! via [`Config::mongo_poll`].
//!
//! ```no_run
//! use mongodb::bson::doc;
//! use rivulet_mongo::{Config, MongoSource, MongoStore};
//!
//! # async fn example() -> Result<(), rivulet_mongo::StoreError> {
//! let store = MongoStore::new(Config::new(MongoSource::Url(
//!     "mongodb://localhost:27017/rivulet".to_string(),
//! )));
//! let snapshot = store.get_snapshot("notes", "note1", None).await?;
//! let result = store.query("notes", doc! { "done": false }, None).await?;
//! # let _ = (snapshot, result);
//! # Ok(())
//! # }
//! ```
pub mod error;
pub mod mongo;
pub mod op;
pub mod poll;
pub mod query;
pub mod snapshot;

use std::time::Duration;

pub use error::StoreError;
pub use mongo::{MongoSource, MongoStore, QueryResult};
pub use op::{Op, OpAction};
pub use query::{CollectionOp, CursorOp, ParsedQuery};
pub use snapshot::{Fields, Snapshot};

/// Default replication-lag allowance for poll reads when a separate poll
/// store is configured.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(300);

/// Adapter configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The primary store; all writes and authoritative reads go here.
    pub mongo: MongoSource,

    /// Optional read-only store for query-poll traffic, typically a
    /// secondary.
    pub mongo_poll: Option<MongoSource>,

    /// Delay applied before each poll read so replication can catch up.
    /// Defaults to 300 ms when `mongo_poll` is set, else 0.
    pub poll_delay: Option<Duration>,

    /// Skip ensuring op-log indexes, for deployments that manage indexes
    /// administratively.
    pub disable_index_creation: bool,

    /// Permit server-side JavaScript (`$where`, `$mapReduce`).
    pub allow_js_queries: bool,

    /// Permit aggregation pipelines (`$aggregate`).
    pub allow_aggregate_queries: bool,

    /// Shorthand implying both `allow_js_queries` and
    /// `allow_aggregate_queries`.
    pub allow_all_queries: bool,
}

impl Config {
    pub fn new(mongo: MongoSource) -> Self {
        Self {
            mongo,
            mongo_poll: None,
            poll_delay: None,
            disable_index_creation: false,
            allow_js_queries: false,
            allow_aggregate_queries: false,
            allow_all_queries: false,
        }
    }

    pub(crate) fn poll_delay(&self) -> Duration {
        match self.poll_delay {
            Some(delay) => delay,
            None if self.mongo_poll.is_some() => DEFAULT_POLL_DELAY,
            None => Duration::ZERO,
        }
    }
}
