use std::collections::HashSet;

use bson::{Bson, Document};

use crate::collation::Collation;
use crate::error::QueryError;
use crate::expr::Expr;
use crate::value::{Number, compare_values, hash_key, is_nullish};

/// A `$group` accumulator: `{ <name>: { $sum: <expr> } }`.
#[derive(Debug, Clone)]
pub enum Accumulator {
    Sum(Expr),
    Avg(Expr),
    Min(Expr),
    Max(Expr),
    First(Expr),
    Last(Expr),
    Push(Expr),
    AddToSet(Expr),
    Count,
}

impl Accumulator {
    pub fn parse(field: &str, spec: &Bson) -> Result<Self, QueryError> {
        let Bson::Document(doc) = spec else {
            return Err(QueryError::InvalidStage(format!(
                "the field '{field}' must be an accumulator object"
            )));
        };
        let mut entries = doc.iter();
        let (name, operand) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(QueryError::InvalidStage(format!(
                    "the field '{field}' must specify one accumulator"
                )));
            }
        };
        let expr = || Expr::parse(operand);
        Ok(match name.as_str() {
            "$sum" => Accumulator::Sum(expr()?),
            "$avg" => Accumulator::Avg(expr()?),
            "$min" => Accumulator::Min(expr()?),
            "$max" => Accumulator::Max(expr()?),
            "$first" => Accumulator::First(expr()?),
            "$last" => Accumulator::Last(expr()?),
            "$push" => Accumulator::Push(expr()?),
            "$addToSet" => Accumulator::AddToSet(expr()?),
            "$count" => Accumulator::Count,
            other => {
                return Err(QueryError::InvalidStage(format!(
                    "unknown group operator '{other}'"
                )));
            }
        })
    }

    pub(crate) fn start(&self) -> AccumulatorState {
        match self {
            Accumulator::Sum(_) | Accumulator::Count => AccumulatorState::Sum(Number::Int32(0)),
            Accumulator::Avg(_) => AccumulatorState::Avg { total: 0.0, count: 0 },
            Accumulator::Min(_) | Accumulator::Max(_) => AccumulatorState::Extreme(None),
            Accumulator::First(_) => AccumulatorState::First(None),
            Accumulator::Last(_) => AccumulatorState::Last(Bson::Null),
            Accumulator::Push(_) => AccumulatorState::Push(Vec::new()),
            Accumulator::AddToSet(_) => AccumulatorState::AddToSet(Vec::new(), HashSet::new()),
        }
    }

    /// Fold one document into `state`.
    pub(crate) fn accumulate(
        &self,
        state: &mut AccumulatorState,
        doc: &Document,
        collation: Option<&Collation>,
    ) -> Result<(), QueryError> {
        match (self, state) {
            (Accumulator::Count, AccumulatorState::Sum(total)) => {
                *total = total.add(Number::Int32(1));
            }
            (Accumulator::Sum(expr), AccumulatorState::Sum(total)) => {
                // Non-numeric values, arrays included, are ignored.
                if let Some(n) = expr.eval(doc, collation)?.as_ref().and_then(Number::from_bson) {
                    *total = total.add(n);
                }
            }
            (Accumulator::Avg(expr), AccumulatorState::Avg { total, count }) => {
                if let Some(n) = expr.eval(doc, collation)?.as_ref().and_then(Number::from_bson) {
                    *total += n.as_f64();
                    *count += 1;
                }
            }
            (Accumulator::Min(expr), AccumulatorState::Extreme(best)) => {
                keep_extreme(best, expr.eval(doc, collation)?, collation, |o| o.is_lt());
            }
            (Accumulator::Max(expr), AccumulatorState::Extreme(best)) => {
                keep_extreme(best, expr.eval(doc, collation)?, collation, |o| o.is_gt());
            }
            (Accumulator::First(expr), AccumulatorState::First(slot)) => {
                if slot.is_none() {
                    *slot = Some(expr.eval_or_null(doc, collation)?);
                }
            }
            (Accumulator::Last(expr), AccumulatorState::Last(slot)) => {
                *slot = expr.eval_or_null(doc, collation)?;
            }
            (Accumulator::Push(expr), AccumulatorState::Push(items)) => {
                if let Some(v) = expr.eval(doc, collation)? {
                    items.push(v);
                }
            }
            (Accumulator::AddToSet(expr), AccumulatorState::AddToSet(items, seen)) => {
                if let Some(v) = expr.eval(doc, collation)?
                    && seen.insert(hash_key(&v, collation))
                {
                    items.push(v);
                }
            }
            _ => {
                return Err(QueryError::Evaluation(
                    "accumulator state does not match its operator".into(),
                ));
            }
        }
        Ok(())
    }
}

fn keep_extreme(
    best: &mut Option<Bson>,
    candidate: Option<Bson>,
    collation: Option<&Collation>,
    better: fn(std::cmp::Ordering) -> bool,
) {
    let Some(v) = candidate.filter(|v| !is_nullish(v)) else {
        return;
    };
    match best {
        Some(current) if !better(compare_values(&v, current, collation)) => {}
        _ => *best = Some(v),
    }
}

/// Running state for one accumulator within one group.
#[derive(Debug, Clone)]
pub(crate) enum AccumulatorState {
    Sum(Number),
    Avg { total: f64, count: u64 },
    Extreme(Option<Bson>),
    First(Option<Bson>),
    Last(Bson),
    Push(Vec<Bson>),
    AddToSet(Vec<Bson>, HashSet<String>),
}

impl AccumulatorState {
    pub(crate) fn finish(self) -> Bson {
        match self {
            AccumulatorState::Sum(total) => total.to_bson(),
            AccumulatorState::Avg { count: 0, .. } => Bson::Null,
            AccumulatorState::Avg { total, count } => Bson::Double(total / count as f64),
            AccumulatorState::Extreme(best) => best.unwrap_or(Bson::Null),
            AccumulatorState::First(slot) => slot.unwrap_or(Bson::Null),
            AccumulatorState::Last(v) => v,
            AccumulatorState::Push(items) | AccumulatorState::AddToSet(items, _) => {
                Bson::Array(items)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn run(spec: Bson, docs: &[Document]) -> Bson {
        let acc = Accumulator::parse("out", &spec).unwrap();
        let mut state = acc.start();
        for d in docs {
            acc.accumulate(&mut state, d, None).unwrap();
        }
        state.finish()
    }

    fn docs() -> Vec<Document> {
        vec![
            doc! { "v": 3, "tag": "a" },
            doc! { "v": 1.5, "tag": "b" },
            doc! { "tag": "a" },
            doc! { "v": "text", "tag": "c" },
        ]
    }

    #[test]
    fn sum_skips_non_numbers() {
        assert_eq!(run(Bson::Document(doc! { "$sum": "$v" }), &docs()), Bson::Double(4.5));
        assert_eq!(run(Bson::Document(doc! { "$sum": 1 }), &docs()), Bson::Int32(4));
        assert_eq!(run(Bson::Document(doc! { "$count": {} }), &docs()), Bson::Int32(4));
    }

    #[test]
    fn avg_of_nothing_is_null() {
        assert_eq!(run(Bson::Document(doc! { "$avg": "$v" }), &docs()), Bson::Double(2.25));
        assert_eq!(run(Bson::Document(doc! { "$avg": "$none" }), &docs()), Bson::Null);
    }

    #[test]
    fn min_max_ignore_missing() {
        assert_eq!(run(Bson::Document(doc! { "$min": "$v" }), &docs()), Bson::Double(1.5));
        // Strings sort above numbers.
        assert_eq!(
            run(Bson::Document(doc! { "$max": "$v" }), &docs()),
            Bson::String("text".into())
        );
    }

    #[test]
    fn first_last_push_and_set() {
        assert_eq!(run(Bson::Document(doc! { "$first": "$v" }), &docs()), Bson::Int32(3));
        assert_eq!(
            run(Bson::Document(doc! { "$last": "$v" }), &docs()),
            Bson::String("text".into())
        );
        assert_eq!(
            run(Bson::Document(doc! { "$push": "$tag" }), &docs()),
            Bson::Array(vec!["a".into(), "b".into(), "a".into(), "c".into()])
        );
        assert_eq!(
            run(Bson::Document(doc! { "$addToSet": "$tag" }), &docs()),
            Bson::Array(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn rejects_unknown_accumulators() {
        assert!(Accumulator::parse("x", &Bson::Document(doc! { "$median": "$v" })).is_err());
        assert!(Accumulator::parse("x", &Bson::Int32(1)).is_err());
    }
}
