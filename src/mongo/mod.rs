// SPDX-License-Identifier: MIT OR Apache-2.0

//! The MongoDB-backed adapter: connection handling and the store surface
//! consumed by the document server.
pub mod connection;
pub mod store;

pub use connection::MongoSource;
pub use store::{MongoStore, QueryResult};
