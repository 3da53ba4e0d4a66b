//! MongoDB-style command layer over pluggable document storage.
//!
//! [`Database::command`] parses a command document, pushes what it can of
//! the resulting pipeline down to the backend, evaluates the rest in
//! process and hands results out through cursors. Applied writes are
//! published on a change bus, which also keeps materialized views fresh.

mod aggregator;
mod analysis;
mod change_bus;
mod changeset;
mod command;
mod config;
mod cursor;
mod database;
mod engine;
mod error;
mod planner;
mod result;
mod view;

pub use aggregator::{
    Aggregator, AggregatorFactory, AggregatorOptions, MemoryAggregator, MemoryAggregatorFactory,
};
pub use analysis::QueryAnalysis;
pub use bson::{Bson, Document};
pub use change_bus::{ChangeBus, ListenerId, PublishingWritable};
pub use changeset::ChangeSet;
pub use config::DatabaseConfig;
pub use cursor::{Cursor, CursorRegistry};
pub use database::Database;
pub use engine::{AggregateInput, AggregationEngine};
pub use error::DbError;
pub use planner::QueryPlanner;
pub use quarry_store::{ChangeStreamDocument, Namespace, OperationType};
pub use view::{View, ViewState};
