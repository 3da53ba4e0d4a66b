use std::collections::HashMap;
use std::sync::Arc;

use bson::{Bson, Document};
use quarry_query::{
    Collation, DocumentIter, MergeSpec, OutSpec, Pipeline, PipelineContext, Sink, WhenMatched,
    WhenNotMatched, hash_key, lookup_path,
};
use quarry_store::{ChangeStreamDocument, Namespace, StoreError, Writable, WriteOptions};

use crate::changeset::{ChangeSet, ensure_id};
use crate::error::DbError;

/// Everything an aggregator may need beyond its input stream.
#[derive(Clone)]
pub struct AggregatorOptions {
    /// Namespace the pipeline runs in; sinks without a `db` write here.
    pub ns: Namespace,
    pub collation: Option<Collation>,
    /// Contents of `$lookup` sources and sink targets, read up front.
    pub foreign_inputs: HashMap<Namespace, Vec<Document>>,
    pub out: Option<OutSpec>,
    pub merge: Option<MergeSpec>,
    /// Where `$out` / `$merge` write.
    pub writable: Option<Arc<dyn Writable>>,
}

impl AggregatorOptions {
    pub fn new(ns: Namespace) -> Self {
        Self {
            ns,
            collation: None,
            foreign_inputs: HashMap::new(),
            out: None,
            merge: None,
            writable: None,
        }
    }
}

/// Runs the stages left after push-down over an input stream.
pub trait Aggregator: Send {
    fn stream(self: Box<Self>, input: DocumentIter<DbError>) -> DocumentIter<DbError>;

    fn run(self: Box<Self>, input: DocumentIter<DbError>) -> Result<Vec<Document>, DbError> {
        self.stream(input).collect()
    }
}

pub trait AggregatorFactory: Send + Sync {
    fn create(
        &self,
        pipeline: &[Document],
        options: AggregatorOptions,
    ) -> Result<Box<dyn Aggregator>, DbError>;
}

/// Builds [`MemoryAggregator`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryAggregatorFactory;

impl AggregatorFactory for MemoryAggregatorFactory {
    fn create(
        &self,
        pipeline: &[Document],
        options: AggregatorOptions,
    ) -> Result<Box<dyn Aggregator>, DbError> {
        let mut pipeline = Pipeline::parse(pipeline)?;
        let parsed_sink = pipeline.take_sink();
        let sink = match (&options.out, &options.merge) {
            (Some(spec), _) => Some(Sink::Out(spec.clone())),
            (None, Some(spec)) => Some(Sink::Merge(spec.clone())),
            (None, None) => parsed_sink,
        };

        let mut ctx = PipelineContext::new(options.collation.clone());
        for (ns, docs) in &options.foreign_inputs {
            if ns.db == options.ns.db {
                ctx = ctx.with_foreign(ns.coll.clone(), docs.clone());
            }
        }

        Ok(Box::new(MemoryAggregator {
            pipeline,
            sink,
            ctx: Arc::new(ctx),
            options,
        }))
    }
}

/// The in-process pipeline evaluator.
pub struct MemoryAggregator {
    pipeline: Pipeline,
    sink: Option<Sink>,
    ctx: Arc<PipelineContext>,
    options: AggregatorOptions,
}

impl Aggregator for MemoryAggregator {
    fn stream(self: Box<Self>, input: DocumentIter<DbError>) -> DocumentIter<DbError> {
        let MemoryAggregator {
            pipeline,
            sink,
            ctx,
            options,
        } = *self;
        let output = pipeline.stream(input, ctx);
        match sink {
            None => output,
            Some(sink) => Box::new(SinkIterator {
                pending: Some(Box::new(move || write_sink(sink, output, &options))),
            }),
        }
    }
}

// ── Sinks ───────────────────────────────────────────────────────

type PendingWrite = Box<dyn FnOnce() -> Result<(), DbError> + Send>;

/// Performs the sink write on the first pull and yields nothing, or the
/// write's error.
struct SinkIterator {
    pending: Option<PendingWrite>,
}

impl Iterator for SinkIterator {
    type Item = Result<Document, DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        let write = self.pending.take()?;
        write().err().map(Err)
    }
}

fn write_sink(
    sink: Sink,
    output: DocumentIter<DbError>,
    options: &AggregatorOptions,
) -> Result<(), DbError> {
    let results = output.collect::<Result<Vec<_>, _>>()?;
    let resolve = |spec: &OutSpec| {
        Namespace::new(
            spec.db.as_deref().unwrap_or(&options.ns.db),
            spec.coll.as_str(),
        )
    };
    let existing = |target: &Namespace| {
        options
            .foreign_inputs
            .get(target)
            .cloned()
            .unwrap_or_default()
    };

    let (target, changes) = match sink {
        Sink::Out(spec) => {
            let target = resolve(&spec);
            let results = results.into_iter().map(ensure_id).collect();
            let changes = ChangeSet::difference(existing(&target), results).to_changes(&target);
            (target, changes)
        }
        Sink::Merge(spec) => {
            let target = resolve(&spec.into);
            let changes = merge_changes(
                &spec,
                &target,
                existing(&target),
                results,
                options.collation.as_ref(),
            )?;
            (target, changes)
        }
    };
    if changes.is_empty() {
        return Ok(());
    }

    let writable = options.writable.as_deref().ok_or_else(|| DbError::SinkWrite {
        ns: target.clone(),
        errmsg: "no writable backend for pipeline output".into(),
    })?;
    let errors = writable.write(&changes, WriteOptions { ordered: true })?;
    if let Some(first) = errors.first() {
        return Err(DbError::SinkWrite {
            ns: target,
            errmsg: first.errmsg.clone(),
        });
    }
    tracing::debug!(ns = %target, n = changes.len(), "wrote pipeline output");
    Ok(())
}

fn merge_changes(
    spec: &MergeSpec,
    target: &Namespace,
    existing: Vec<Document>,
    results: Vec<Document>,
    collation: Option<&Collation>,
) -> Result<Vec<ChangeStreamDocument>, DbError> {
    let mut matched: HashMap<String, Document> = existing
        .into_iter()
        .filter_map(|doc| merge_key(&doc, &spec.on, collation).map(|key| (key, doc)))
        .collect();
    let on_id = spec.on.iter().all(|f| f == "_id");

    let mut changes = Vec::new();
    for doc in results {
        let doc = if on_id { ensure_id(doc) } else { doc };
        let key = merge_key(&doc, &spec.on, collation).ok_or_else(|| {
            DbError::BadValue(format!(
                "$merge write error: 'on' field(s) {:?} must be present and not null or an array",
                spec.on
            ))
        })?;

        let next = match (matched.get(&key), spec.when_matched, spec.when_not_matched) {
            (Some(_), WhenMatched::KeepExisting, _) | (None, _, WhenNotMatched::Discard) => {
                continue;
            }
            (Some(_), WhenMatched::Fail, _) => {
                return Err(DbError::Store(StoreError::DuplicateKey {
                    collection: target.to_string(),
                    id: key,
                }));
            }
            (None, _, WhenNotMatched::Fail) => {
                return Err(DbError::SinkWrite {
                    ns: target.clone(),
                    errmsg: "$merge could not find a matching document in the target collection"
                        .into(),
                });
            }
            (Some(current), WhenMatched::Replace, _) => {
                let replaced = keep_id(doc, current);
                changes.push(ChangeStreamDocument::replace(target.clone(), replaced.clone()));
                replaced
            }
            (Some(current), WhenMatched::Merge, _) => {
                let mut merged = current.clone();
                for (k, v) in doc {
                    if k != "_id" {
                        merged.insert(k, v);
                    }
                }
                changes.push(ChangeStreamDocument::update(target.clone(), merged.clone()));
                merged
            }
            (None, _, WhenNotMatched::Insert) => {
                let inserted = ensure_id(doc);
                changes.push(ChangeStreamDocument::insert(target.clone(), inserted.clone()));
                inserted
            }
        };
        matched.insert(key, next);
    }
    Ok(changes)
}

/// Identity of a document under `$merge`'s `on` fields.
fn merge_key(doc: &Document, on: &[String], collation: Option<&Collation>) -> Option<String> {
    let mut key = String::new();
    for field in on {
        match lookup_path(doc, field) {
            None | Some(Bson::Null) | Some(Bson::Array(_)) => return None,
            Some(value) => {
                key.push_str(&hash_key(value, collation));
                key.push('\u{1}');
            }
        }
    }
    Some(key)
}

/// `doc` with `current`'s `_id` in front.
fn keep_id(doc: Document, current: &Document) -> Document {
    let mut out = Document::new();
    if let Some(id) = current.get("_id") {
        out.insert("_id", id.clone());
    }
    for (k, v) in doc {
        if k != "_id" {
            out.insert(k, v);
        }
    }
    out
}
