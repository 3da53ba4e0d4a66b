use std::collections::HashMap;
use std::sync::Arc;

use bson::Document;
use quarry_query::{Collation, DocumentIter};
use quarry_store::{DocumentAccess, Namespace, Writable};

use crate::aggregator::{AggregatorFactory, AggregatorOptions};
use crate::analysis::QueryAnalysis;
use crate::change_bus::{ChangeBus, PublishingWritable};
use crate::cursor::CursorRegistry;
use crate::error::DbError;
use crate::planner::QueryPlanner;
use crate::view::ViewRegistry;

/// Where an aggregation reads from.
pub enum AggregateInput {
    /// A collection (or view) of the pipeline's database, read with
    /// push-down.
    Collection(String),
    /// Literal documents; the whole pipeline runs in process.
    Documents(Vec<Document>),
    Stream(DocumentIter<DbError>),
}

/// Wires planner, aggregator and cursor registry together.
pub struct AggregationEngine {
    access: Arc<dyn DocumentAccess>,
    planner: QueryPlanner,
    views: Arc<ViewRegistry>,
    cursors: Arc<CursorRegistry>,
    factory: Arc<dyn AggregatorFactory>,
    bus: Arc<ChangeBus>,
}

impl AggregationEngine {
    pub(crate) fn new(
        access: Arc<dyn DocumentAccess>,
        views: Arc<ViewRegistry>,
        cursors: Arc<CursorRegistry>,
        factory: Arc<dyn AggregatorFactory>,
        bus: Arc<ChangeBus>,
    ) -> Self {
        Self {
            planner: QueryPlanner::new(Arc::clone(&access), Arc::clone(&views)),
            access,
            views,
            cursors,
            factory,
            bus,
        }
    }

    pub fn planner(&self) -> &QueryPlanner {
        &self.planner
    }

    /// Runs `pipeline` and registers the result as a cursor on `ns`.
    pub fn aggregate(
        &self,
        ns: &Namespace,
        input: AggregateInput,
        pipeline: Vec<Document>,
        collation: Option<Collation>,
    ) -> Result<i64, DbError> {
        let stream = self.open(ns, input, pipeline, collation)?;
        Ok(self.cursors.add_cursor(ns.clone(), stream))
    }

    /// Runs `pipeline` to completion without registering a cursor.
    pub fn collect(
        &self,
        ns: &Namespace,
        input: AggregateInput,
        pipeline: Vec<Document>,
        collation: Option<Collation>,
    ) -> Result<Vec<Document>, DbError> {
        self.open(ns, input, pipeline, collation)?.collect()
    }

    /// The lazy result stream of `pipeline`. Sources and foreign inputs
    /// are resolved here; nothing is evaluated until the stream is pulled.
    pub fn open(
        &self,
        ns: &Namespace,
        input: AggregateInput,
        pipeline: Vec<Document>,
        collation: Option<Collation>,
    ) -> Result<DocumentIter<DbError>, DbError> {
        let analysis = QueryAnalysis::new(&ns.db, pipeline, collation)?;

        let target = analysis.sink_target();
        if let Some(target) = &target
            && self.views.contains(target)
        {
            return Err(DbError::ViewReadOnly(target.clone()));
        }

        let mut foreign_inputs = HashMap::new();
        for foreign in analysis.foreign_inputs.iter().chain(target.as_ref()) {
            if !foreign_inputs.contains_key(foreign) {
                let docs = self.planner.resolve_all(foreign)?;
                foreign_inputs.insert(foreign.clone(), docs);
            }
        }

        let writable = match &target {
            Some(target) => Some(Arc::new(PublishingWritable::new(
                self.access.writable(&target.db)?,
                Arc::clone(&self.bus),
            )) as Arc<dyn Writable>),
            None => None,
        };

        let (source, stages) = match input {
            AggregateInput::Collection(coll) => (
                self.planner
                    .resolve_documents(&ns.sibling(coll), Some(&analysis))?,
                analysis.remaining(),
            ),
            AggregateInput::Documents(docs) => (
                Box::new(docs.into_iter().map(Ok)) as DocumentIter<DbError>,
                analysis.pipeline(),
            ),
            AggregateInput::Stream(stream) => (stream, analysis.pipeline()),
        };

        let options = AggregatorOptions {
            ns: ns.clone(),
            collation: analysis.collation.clone(),
            foreign_inputs,
            out: analysis.out.clone(),
            merge: analysis.merge.clone(),
            writable,
        };
        let aggregator = self.factory.create(stages, options)?;
        Ok(aggregator.stream(source))
    }
}
