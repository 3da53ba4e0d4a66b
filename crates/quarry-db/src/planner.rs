use std::sync::Arc;

use bson::{Bson, Document};
use quarry_query::{
    Collation, DocumentIter, Pipeline, PipelineContext, Projection, Stage, parse_filter,
    parse_sort,
};
use quarry_store::{DocumentAccess, DocumentStream, Namespace, StreamOptions, Streamable};

use crate::analysis::QueryAnalysis;
use crate::error::DbError;
use crate::view::ViewRegistry;

/// Turns a namespace plus an optional push-down analysis into a document
/// stream.
///
/// Backend hints are optimizations only: the pushed-down filter, sort,
/// skip, limit and projection are always re-applied here.
pub struct QueryPlanner {
    access: Arc<dyn DocumentAccess>,
    views: Arc<ViewRegistry>,
}

impl QueryPlanner {
    pub(crate) fn new(access: Arc<dyn DocumentAccess>, views: Arc<ViewRegistry>) -> Self {
        Self { access, views }
    }

    pub fn resolve_documents(
        &self,
        ns: &Namespace,
        analysis: Option<&QueryAnalysis>,
    ) -> Result<DocumentIter<DbError>, DbError> {
        let source = self.source(ns)?;
        let Some(analysis) = analysis else {
            return Ok(into_db_stream(
                source.stream(&ns.coll, &StreamOptions::default())?,
            ));
        };

        let options = stream_options(analysis);
        tracing::debug!(
            ns = %ns,
            id_hint = options.document_ids.as_ref().map(Vec::len),
            projection_hint = options.projection.is_some(),
            "resolving documents"
        );
        let stream = into_db_stream(source.stream(&ns.coll, &options)?);
        let pushed = pushed_pipeline(analysis)?;
        if pushed.is_empty() {
            return Ok(stream);
        }
        let ctx = Arc::new(PipelineContext::new(analysis.collation.clone()));
        Ok(pushed.stream(stream, ctx))
    }

    /// Every document of `ns`, in natural order.
    pub fn resolve_all(&self, ns: &Namespace) -> Result<Vec<Document>, DbError> {
        self.resolve_documents(ns, None)?.collect()
    }

    fn source(&self, ns: &Namespace) -> Result<Arc<dyn Streamable>, DbError> {
        match self.views.get(ns) {
            Some(view) => Ok(view.store()),
            None => Ok(self.access.streamable(&ns.db)?),
        }
    }
}

fn into_db_stream(stream: DocumentStream) -> DocumentIter<DbError> {
    Box::new(stream.map(|r| r.map_err(DbError::from)))
}

fn stream_options(analysis: &QueryAnalysis) -> StreamOptions {
    let filter = analysis.filter.as_ref();
    let document_ids = filter.and_then(|f| id_hint(f, analysis.collation.as_ref()));
    let unfiltered = filter.is_none_or(Document::is_empty);
    let id_only = filter.is_none_or(|f| f.keys().all(|k| k == "_id"));
    // The filter runs after the backend projects, so it must still see `_id`.
    let projection = analysis
        .projection
        .as_ref()
        .filter(|p| analysis.sort.is_none() && (unfiltered || (id_only && keeps_id(p))))
        .cloned();
    StreamOptions {
        document_ids,
        projection,
    }
}

/// Whether `projection` leaves `_id` in place.
fn keeps_id(projection: &Document) -> bool {
    match projection.get("_id") {
        None => true,
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::Int32(n)) => *n != 0,
        Some(Bson::Int64(n)) => *n != 0,
        Some(Bson::Double(f)) => *f != 0.0,
        Some(_) => false,
    }
}

/// Explicit `_id` values named by an equality or `$in` condition.
fn id_hint(filter: &Document, collation: Option<&Collation>) -> Option<Vec<Bson>> {
    let ids = match filter.get("_id")? {
        Bson::Document(cond) if cond.keys().any(|k| k.starts_with('$')) => {
            let mut entries = cond.iter();
            match (entries.next(), entries.next()) {
                (Some((op, value)), None) if op == "$eq" => vec![value.clone()],
                (Some((op, Bson::Array(items))), None) if op == "$in" => items.clone(),
                _ => return None,
            }
        }
        value => vec![value.clone()],
    };
    let folds_case = collation.is_some_and(Collation::ignores_case);
    let literal = ids.iter().all(|id| match id {
        Bson::RegularExpression(_) => false,
        Bson::String(_) => !folds_case,
        _ => true,
    });
    literal.then_some(ids)
}

fn pushed_pipeline(analysis: &QueryAnalysis) -> Result<Pipeline, DbError> {
    let mut stages = Vec::new();
    if let Some(filter) = analysis.filter.as_ref().filter(|f| !f.is_empty()) {
        stages.push(Stage::Match(parse_filter(filter)?));
    }
    if let Some(sort) = &analysis.sort {
        stages.push(Stage::Sort(parse_sort(sort)?));
    }
    if let Some(n) = analysis.skip {
        stages.push(Stage::Skip(n));
    }
    if let Some(n) = analysis.limit {
        stages.push(Stage::Limit(n));
    }
    if let Some(projection) = &analysis.projection {
        stages.push(Stage::Project(Projection::parse(projection)?));
    }
    Ok(Pipeline::new(stages))
}
