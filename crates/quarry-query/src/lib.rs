//! In-memory evaluation of MongoDB-style filters and aggregation pipelines.
//!
//! Pipelines are pull-based: each stage wraps the iterator of the stage
//! before it, so `$limit` (or a cursor that stops asking) stops the whole
//! chain from reading further input. Blocking stages (`$sort`, `$group`,
//! `$count`, `$sortByCount`) drain their input on the first pull.

mod accumulator;
mod collation;
mod error;
mod expr;
mod filter;
mod path;
mod pipeline;
mod projection;
mod sort;
mod stage;
mod value;

pub use accumulator::Accumulator;
pub use collation::Collation;
pub use error::QueryError;
pub use expr::{Expr, Operator};
pub use filter::{Condition, ElemMatch, Filter, parse_filter};
pub use path::{lookup_path, remove_path, set_path};
pub use pipeline::{DocumentIter, Pipeline, PipelineContext, Sink};
pub use projection::{Node, Projection};
pub use sort::{Sort, SortDirection, parse_sort};
pub use stage::{
    Group, Lookup, MergeSpec, OutSpec, Stage, Unwind, WhenMatched, WhenNotMatched, stage_name,
};
pub use value::{compare_values, hash_key, is_truthy, values_equal};
