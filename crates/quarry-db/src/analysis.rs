use bson::{Bson, Document};
use quarry_query::{Collation, MergeSpec, OutSpec, Pipeline, Stage};
use quarry_store::Namespace;

use crate::error::DbError;

/// What a pipeline asks of its source, split into the prefix a backend
/// can help with and the stages left for the aggregator.
#[derive(Debug, Clone, Default)]
pub struct QueryAnalysis {
    db: String,
    pipeline: Vec<Document>,
    pushed: usize,
    pub collation: Option<Collation>,
    pub filter: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Document>,
    /// Collections read by `$lookup` or targeted by `$merge`, first-seen
    /// order, no duplicates.
    pub foreign_inputs: Vec<Namespace>,
    pub out: Option<OutSpec>,
    pub merge: Option<MergeSpec>,
}

impl QueryAnalysis {
    /// Validates `pipeline` and scans it for push-down.
    pub fn new(
        db: &str,
        pipeline: Vec<Document>,
        collation: Option<Collation>,
    ) -> Result<Self, DbError> {
        let parsed = Pipeline::parse(&pipeline)?;
        let mut analysis = QueryAnalysis {
            db: db.to_string(),
            collation,
            ..QueryAnalysis::default()
        };

        let mut skip = 0_u64;
        for (index, (raw, stage)) in pipeline.iter().zip(parsed.stages()).enumerate() {
            let only_matched = analysis.pushed == usize::from(analysis.filter.is_some());
            match stage {
                Stage::Match(_) if index == 0 => analysis.filter = stage_document(raw),
                Stage::Sort(_) if only_matched => analysis.sort = stage_document(raw),
                Stage::Skip(n) => {
                    skip += n;
                    analysis.limit = analysis.limit.map(|l| l.saturating_sub(*n));
                }
                Stage::Limit(n) => {
                    analysis.limit = Some(analysis.limit.map_or(*n, |l| l.min(*n)));
                }
                Stage::Project(_) if analysis.projection.is_none() => {
                    analysis.projection = stage_document(raw);
                }
                _ => break,
            }
            analysis.pushed += 1;
        }
        analysis.skip = (skip > 0).then_some(skip);

        for stage in parsed.stages() {
            let ns = match stage {
                Stage::Lookup(lookup) => Namespace::new(db, lookup.from.as_str()),
                Stage::Merge(spec) => analysis.resolve(&spec.into),
                _ => continue,
            };
            if !analysis.foreign_inputs.contains(&ns) {
                analysis.foreign_inputs.push(ns);
            }
        }

        match parsed.stages().last() {
            Some(Stage::Out(spec)) => analysis.out = Some(spec.clone()),
            Some(Stage::Merge(spec)) => analysis.merge = Some(spec.clone()),
            _ => {}
        }

        analysis.pipeline = pipeline;
        tracing::debug!(
            db,
            pushed = analysis.pushed,
            remaining = analysis.remaining().len(),
            "analyzed pipeline"
        );
        Ok(analysis)
    }

    pub fn pipeline(&self) -> &[Document] {
        &self.pipeline
    }

    /// Number of leading stages covered by the push-down fields.
    pub fn pushed(&self) -> usize {
        self.pushed
    }

    /// Stages after the pushed-down prefix.
    pub fn remaining(&self) -> &[Document] {
        &self.pipeline[self.pushed..]
    }

    /// Where a trailing `$out` or `$merge` writes.
    pub fn sink_target(&self) -> Option<Namespace> {
        match (&self.out, &self.merge) {
            (Some(spec), _) => Some(self.resolve(spec)),
            (None, Some(spec)) => Some(self.resolve(&spec.into)),
            (None, None) => None,
        }
    }

    fn resolve(&self, spec: &OutSpec) -> Namespace {
        Namespace::new(spec.db.as_deref().unwrap_or(&self.db), spec.coll.as_str())
    }
}

fn stage_document(raw: &Document) -> Option<Document> {
    match raw.iter().next() {
        Some((_, Bson::Document(spec))) => Some(spec.clone()),
        _ => None,
    }
}
