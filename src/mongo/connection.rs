// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lazy connection management for the primary and poll stores.
//!
//! Connecting starts when the adapter is constructed; callers that arrive
//! earlier all await the same in-flight attempt. The primary and poll
//! handles become visible together, so no caller can observe one without the
//! other.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Where the adapter gets its store clients from.
///
/// The connection target must name a database, e.g.
/// `mongodb://localhost:27017/rivulet`.
#[derive(Clone, Debug)]
pub enum MongoSource {
    /// A connection string, parsed and connected on first use.
    Url(String),
    /// Pre-built client options, for callers that need driver settings the
    /// connection string cannot express.
    Options(ClientOptions),
    /// An already constructed client.
    Client(Client),
}

#[derive(Debug)]
pub(crate) struct Handles {
    pub primary: Database,
    pub poll: Option<Database>,
    primary_client: Client,
    poll_client: Option<Client>,
}

#[derive(Clone, Debug)]
pub(crate) struct Connection {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    source: MongoSource,
    poll_source: Option<MongoSource>,
    poll_delay: Duration,
    handles: OnceCell<Handles>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        source: MongoSource,
        poll_source: Option<MongoSource>,
        poll_delay: Duration,
    ) -> Self {
        let connection = Self {
            inner: Arc::new(Inner {
                source,
                poll_source,
                poll_delay,
                handles: OnceCell::new(),
                closed: AtomicBool::new(false),
            }),
        };
        // Start connecting right away when a runtime is available; failures
        // here surface again on the first real operation.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let warmup = connection.clone();
            runtime.spawn(async move {
                if let Err(err) = warmup.handles().await {
                    warn!("initial store connection attempt failed: {err}");
                }
            });
        }
        connection
    }

    async fn handles(&self) -> Result<&Handles, StoreError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let handles = self
            .inner
            .handles
            .get_or_try_init(|| connect(&self.inner.source, self.inner.poll_source.as_ref()))
            .await?;
        // close() may have won the race against the connect.
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(handles)
    }

    /// The authoritative database; all writes and canonical reads go here.
    pub(crate) async fn primary(&self) -> Result<Database, StoreError> {
        Ok(self.handles().await?.primary.clone())
    }

    /// The database used for query-poll traffic, after waiting out the
    /// configured replication-lag window. Falls back to the primary when no
    /// separate poll store is configured.
    pub(crate) async fn poll(&self) -> Result<Database, StoreError> {
        let handles = self.handles().await?;
        let database = handles
            .poll
            .clone()
            .unwrap_or_else(|| handles.primary.clone());
        if !self.inner.poll_delay.is_zero() {
            tokio::time::sleep(self.inner.poll_delay).await;
        }
        Ok(database)
    }

    /// Mark the adapter closed, then release the clients. Safe to call more
    /// than once.
    pub(crate) async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handles) = self.inner.handles.get() {
            debug!("shutting down store clients");
            handles.primary_client.clone().shutdown().await;
            if let Some(poll_client) = &handles.poll_client {
                poll_client.clone().shutdown().await;
            }
        }
    }
}

async fn connect(
    source: &MongoSource,
    poll_source: Option<&MongoSource>,
) -> Result<Handles, StoreError> {
    let primary_client = client_for(source).await?;
    let primary = default_database(&primary_client)?;
    let (poll_client, poll) = match poll_source {
        Some(source) => {
            let client = client_for(source).await?;
            let database = default_database(&client)?;
            (Some(client), Some(database))
        }
        None => (None, None),
    };
    debug!(database = primary.name(), "connected to store");
    Ok(Handles {
        primary,
        poll,
        primary_client,
        poll_client,
    })
}

async fn client_for(source: &MongoSource) -> Result<Client, StoreError> {
    match source {
        MongoSource::Url(url) => Ok(Client::with_uri_str(url).await?),
        MongoSource::Options(options) => Ok(Client::with_options(options.clone())?),
        MongoSource::Client(client) => Ok(client.clone()),
    }
}

fn default_database(client: &Client) -> Result<Database, StoreError> {
    client.default_database().ok_or(StoreError::MissingDatabase)
}
