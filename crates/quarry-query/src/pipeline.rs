use std::collections::HashMap;
use std::sync::Arc;

use bson::{Bson, Document, doc};

use crate::collation::Collation;
use crate::error::QueryError;
use crate::expr::Expr;
use crate::filter::Filter;
use crate::path::{leaf_values, lookup_path, remove_path, set_path};
use crate::sort::{Sort, SortDirection, sort_documents};
use crate::stage::{Group, Lookup, MergeSpec, OutSpec, Stage, Unwind};
use crate::value::{hash_key, values_equal};

/// Boxed, sendable stream of documents; the unit every stage consumes
/// and produces.
pub type DocumentIter<E> = Box<dyn Iterator<Item = Result<Document, E>> + Send>;

/// Inputs a pipeline needs besides its main stream.
#[derive(Debug, Default)]
pub struct PipelineContext {
    pub collation: Option<Collation>,
    foreign: HashMap<String, Arc<Vec<Document>>>,
}

impl PipelineContext {
    pub fn new(collation: Option<Collation>) -> Self {
        Self {
            collation,
            foreign: HashMap::new(),
        }
    }

    /// Register the contents of a collection read by `$lookup`.
    pub fn with_foreign(mut self, coll: impl Into<String>, docs: Vec<Document>) -> Self {
        self.foreign.insert(coll.into(), Arc::new(docs));
        self
    }

    /// Contents of a foreign collection; unknown names are empty.
    pub fn foreign(&self, coll: &str) -> Arc<Vec<Document>> {
        self.foreign.get(coll).cloned().unwrap_or_default()
    }
}

/// A write-out stage removed from the end of a pipeline for the caller
/// to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Out(OutSpec),
    Merge(MergeSpec),
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Parse stage documents. `$out` / `$merge` may only appear last.
    pub fn parse(specs: &[Document]) -> Result<Self, QueryError> {
        let stages = specs
            .iter()
            .map(Stage::parse)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(pos) = stages.iter().position(Stage::is_sink)
            && pos + 1 != stages.len()
        {
            return Err(QueryError::InvalidStage(
                "$out and $merge can only be the final stage in the pipeline".into(),
            ));
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Detach a trailing `$out` / `$merge`.
    pub fn take_sink(&mut self) -> Option<Sink> {
        match self.stages.last() {
            Some(Stage::Out(_)) | Some(Stage::Merge(_)) => match self.stages.pop() {
                Some(Stage::Out(spec)) => Some(Sink::Out(spec)),
                Some(Stage::Merge(spec)) => Some(Sink::Merge(spec)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Chain every stage over `input`. Nothing is read until the returned
    /// iterator is pulled.
    pub fn stream<E>(self, input: DocumentIter<E>, ctx: Arc<PipelineContext>) -> DocumentIter<E>
    where
        E: From<QueryError> + Send + 'static,
    {
        self.stages
            .into_iter()
            .fold(input, |upstream, stage| apply_stage(stage, upstream, Arc::clone(&ctx)))
    }

    /// Run to completion over an in-memory input.
    pub fn run(self, input: Vec<Document>, ctx: Arc<PipelineContext>) -> Result<Vec<Document>, QueryError> {
        let source: DocumentIter<QueryError> = Box::new(input.into_iter().map(Ok));
        self.stream(source, ctx).collect()
    }
}

fn apply_stage<E>(stage: Stage, input: DocumentIter<E>, ctx: Arc<PipelineContext>) -> DocumentIter<E>
where
    E: From<QueryError> + Send + 'static,
{
    match stage {
        Stage::Match(filter) => Box::new(FilterIterator {
            source: input,
            filter,
            ctx,
        }),
        Stage::Project(projection) => map_documents(input, move |doc| {
            projection.apply(&doc, ctx.collation.as_ref())
        }),
        Stage::AddFields(fields) => map_documents(input, move |doc| {
            add_fields(doc, &fields, ctx.collation.as_ref())
        }),
        Stage::Unset(paths) => map_documents(input, move |mut doc| {
            for path in &paths {
                remove_path(&mut doc, path);
            }
            Ok(doc)
        }),
        Stage::Skip(n) => Box::new(SkipIterator::new(input, n as usize)),
        Stage::Limit(n) => Box::new(input.take(n as usize)),
        Stage::Unwind(spec) => Box::new(input.flat_map(move |item| match item {
            Ok(doc) => unwind(doc, &spec).into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(e)],
        })),
        Stage::Lookup(spec) => {
            let foreign = ctx.foreign(&spec.from);
            map_documents(input, move |doc| {
                Ok(lookup(doc, &spec, &foreign, ctx.collation.as_ref()))
            })
        }
        Stage::ReplaceRoot(expr) => map_documents(input, move |doc| {
            match expr.eval(&doc, ctx.collation.as_ref())? {
                Some(Bson::Document(root)) => Ok(root),
                other => Err(QueryError::Evaluation(format!(
                    "'newRoot' expression must evaluate to an object, but resulting value was: {}",
                    other.map_or_else(|| "MISSING".to_string(), |v| v.to_string())
                ))),
            }
        }),
        Stage::Sort(keys) => Blocking::boxed(input, "$sort", move |mut docs| {
            sort_documents(&mut docs, &keys, ctx.collation.as_ref());
            Ok(docs)
        }),
        Stage::Group(spec) => Blocking::boxed(input, "$group", move |docs| {
            group(&docs, &spec, ctx.collation.as_ref())
        }),
        Stage::Count(field) => Blocking::boxed(input, "$count", move |docs| {
            if docs.is_empty() {
                return Ok(Vec::new());
            }
            let mut out = Document::new();
            out.insert(field, count_value(docs.len()));
            Ok(vec![out])
        }),
        Stage::SortByCount(expr) => Blocking::boxed(input, "$sortByCount", move |docs| {
            sort_by_count(&docs, &expr, ctx.collation.as_ref())
        }),
        Stage::Out(_) | Stage::Merge(_) => Box::new(std::iter::once(Err(E::from(
            QueryError::InvalidStage("$out and $merge must be detached before streaming".into()),
        )))),
    }
}

fn map_documents<E, F>(input: DocumentIter<E>, mut f: F) -> DocumentIter<E>
where
    E: From<QueryError> + Send + 'static,
    F: FnMut(Document) -> Result<Document, QueryError> + Send + 'static,
{
    Box::new(input.map(move |item| item.and_then(|doc| f(doc).map_err(E::from))))
}

fn count_value(n: usize) -> Bson {
    match i32::try_from(n) {
        Ok(n) => Bson::Int32(n),
        Err(_) => Bson::Int64(n as i64),
    }
}

// ── Streaming stages ────────────────────────────────────────────

struct FilterIterator<E> {
    source: DocumentIter<E>,
    filter: Filter,
    ctx: Arc<PipelineContext>,
}

impl<E> Iterator for FilterIterator<E> {
    type Item = Result<Document, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.source.next()? {
                Err(e) => return Some(Err(e)),
                Ok(doc) if self.filter.matches(&doc, self.ctx.collation.as_ref()) => {
                    return Some(Ok(doc));
                }
                Ok(_) => continue,
            }
        }
    }
}

struct SkipIterator<E> {
    source: DocumentIter<E>,
    remaining: usize,
}

impl<E> SkipIterator<E> {
    fn new(source: DocumentIter<E>, skip: usize) -> Self {
        Self {
            source,
            remaining: skip,
        }
    }
}

impl<E> Iterator for SkipIterator<E> {
    type Item = Result<Document, E>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.remaining > 0 {
            match self.source.next()? {
                Err(e) => return Some(Err(e)),
                Ok(_) => self.remaining -= 1,
            }
        }
        self.source.next()
    }
}

fn add_fields(
    doc: Document,
    fields: &[(String, Expr)],
    collation: Option<&Collation>,
) -> Result<Document, QueryError> {
    let mut out = doc.clone();
    for (path, expr) in fields {
        if let Some(v) = expr.eval(&doc, collation)? {
            set_path(&mut out, path, v);
        }
    }
    Ok(out)
}

fn unwind(doc: Document, spec: &Unwind) -> Vec<Document> {
    let index_field = spec.include_array_index.as_deref();
    let with_index = |mut d: Document, index: Bson| {
        if let Some(field) = index_field {
            set_path(&mut d, field, index);
        }
        d
    };
    match lookup_path(&doc, &spec.path) {
        Some(Bson::Array(items)) if !items.is_empty() => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let mut out = doc.clone();
                set_path(&mut out, &spec.path, item.clone());
                with_index(out, Bson::Int64(i as i64))
            })
            .collect(),
        Some(Bson::Array(_)) | Some(Bson::Null) | None => {
            if !spec.preserve_null_and_empty_arrays {
                return Vec::new();
            }
            let mut out = doc.clone();
            if matches!(lookup_path(&doc, &spec.path), Some(Bson::Array(_))) {
                remove_path(&mut out, &spec.path);
            }
            vec![with_index(out, Bson::Null)]
        }
        // A scalar behaves as a one-element array.
        Some(_) => vec![with_index(doc.clone(), Bson::Null)],
    }
}

/// Values used for `$lookup` equality: array values contribute their
/// elements, and a missing field matches as null.
fn join_values<'a>(doc: &'a Document, path: &str) -> Vec<&'a Bson> {
    let mut out = Vec::new();
    for v in leaf_values(doc, path) {
        match v {
            Bson::Array(items) => out.extend(items.iter()),
            other => out.push(other),
        }
    }
    if out.is_empty() {
        out.push(&Bson::Null);
    }
    out
}

fn lookup(
    mut doc: Document,
    spec: &Lookup,
    foreign: &[Document],
    collation: Option<&Collation>,
) -> Document {
    let local = join_values(&doc, &spec.local_field);
    let matched: Vec<Bson> = foreign
        .iter()
        .filter(|f| {
            join_values(f, &spec.foreign_field)
                .iter()
                .any(|fv| local.iter().any(|lv| values_equal(lv, fv, collation)))
        })
        .map(|f| Bson::Document(f.clone()))
        .collect();
    set_path(&mut doc, &spec.as_field, Bson::Array(matched));
    doc
}

// ── Blocking stages ─────────────────────────────────────────────

type Compute = Box<dyn FnOnce(Vec<Document>) -> Result<Vec<Document>, QueryError> + Send>;

/// Drains its input on the first pull, then yields the computed output.
struct Blocking<E> {
    input: Option<DocumentIter<E>>,
    compute: Option<Compute>,
    output: std::vec::IntoIter<Document>,
    stage: &'static str,
}

impl<E> Blocking<E>
where
    E: From<QueryError> + Send + 'static,
{
    fn boxed<F>(input: DocumentIter<E>, stage: &'static str, compute: F) -> DocumentIter<E>
    where
        F: FnOnce(Vec<Document>) -> Result<Vec<Document>, QueryError> + Send + 'static,
    {
        Box::new(Self {
            input: Some(input),
            compute: Some(Box::new(compute)),
            output: Vec::new().into_iter(),
            stage,
        })
    }
}

impl<E> Iterator for Blocking<E>
where
    E: From<QueryError>,
{
    type Item = Result<Document, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(input) = self.input.take() {
            let mut docs = Vec::new();
            for item in input {
                match item {
                    Ok(doc) => docs.push(doc),
                    Err(e) => return Some(Err(e)),
                }
            }
            tracing::trace!(stage = self.stage, documents = docs.len(), "blocking stage drained input");
            let compute = self.compute.take()?;
            match compute(docs) {
                Ok(out) => self.output = out.into_iter(),
                Err(e) => return Some(Err(E::from(e))),
            }
        }
        self.output.next().map(Ok)
    }
}

fn group(
    docs: &[Document],
    spec: &Group,
    collation: Option<&Collation>,
) -> Result<Vec<Document>, QueryError> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups = Vec::new();
    for doc in docs {
        let key = spec.id.eval_or_null(doc, collation)?;
        let slot = *index.entry(hash_key(&key, collation)).or_insert_with(|| {
            let states: Vec<_> = spec.accumulators.iter().map(|(_, acc)| acc.start()).collect();
            groups.push((key, states));
            groups.len() - 1
        });
        for ((_, acc), state) in spec.accumulators.iter().zip(groups[slot].1.iter_mut()) {
            acc.accumulate(state, doc, collation)?;
        }
    }
    Ok(groups
        .into_iter()
        .map(|(key, states)| {
            let mut out = doc! { "_id": key };
            for ((name, _), state) in spec.accumulators.iter().zip(states) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect())
}

fn sort_by_count(
    docs: &[Document],
    expr: &Expr,
    collation: Option<&Collation>,
) -> Result<Vec<Document>, QueryError> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut counts: Vec<(Bson, usize)> = Vec::new();
    for doc in docs {
        let key = expr.eval_or_null(doc, collation)?;
        match index.get(&hash_key(&key, collation)) {
            Some(&slot) => counts[slot].1 += 1,
            None => {
                index.insert(hash_key(&key, collation), counts.len());
                counts.push((key, 1));
            }
        }
    }
    let mut out: Vec<Document> = counts
        .into_iter()
        .map(|(key, n)| doc! { "_id": key, "count": count_value(n) })
        .collect();
    let by_count = [Sort {
        field: "count".to_string(),
        direction: SortDirection::Desc,
    }];
    sort_documents(&mut out, &by_count, collation);
    Ok(out)
}
