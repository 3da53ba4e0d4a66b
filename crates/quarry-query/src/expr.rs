use std::collections::HashMap;
use std::sync::LazyLock;

use bson::{Bson, Document};

use crate::collation::Collation;
use crate::error::QueryError;
use crate::path::resolve_path;
use crate::value::{Number, compare_values, is_nullish, is_truthy};

/// A parsed aggregation expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Bson),
    /// `"$a.b"`
    Field(String),
    /// `"$$ROOT"` / `"$$CURRENT"`, optionally followed by a path.
    Root(Option<String>),
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Operator(&'static Operator, Vec<Expr>),
}

type OperatorFn = fn(&[Bson], Option<&Collation>) -> Result<Bson, QueryError>;

#[derive(Debug, Clone, Copy)]
enum Arity {
    Exact(usize),
    AtLeast(usize),
}

/// A registered expression operator. Arguments arrive evaluated, with
/// missing values as null.
#[derive(Debug)]
pub struct Operator {
    name: &'static str,
    arity: Arity,
    eval: OperatorFn,
}

impl Operator {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ── Registration ────────────────────────────────────────────────

static OPERATOR_TABLE: &[Operator] = &[
    Operator { name: "$add", arity: Arity::AtLeast(0), eval: add },
    Operator { name: "$subtract", arity: Arity::Exact(2), eval: subtract },
    Operator { name: "$multiply", arity: Arity::AtLeast(0), eval: multiply },
    Operator { name: "$divide", arity: Arity::Exact(2), eval: divide },
    Operator { name: "$mod", arity: Arity::Exact(2), eval: modulo },
    Operator { name: "$eq", arity: Arity::Exact(2), eval: |a, c| compare(a, c, |o| o.is_eq()) },
    Operator { name: "$ne", arity: Arity::Exact(2), eval: |a, c| compare(a, c, |o| o.is_ne()) },
    Operator { name: "$gt", arity: Arity::Exact(2), eval: |a, c| compare(a, c, |o| o.is_gt()) },
    Operator { name: "$gte", arity: Arity::Exact(2), eval: |a, c| compare(a, c, |o| o.is_ge()) },
    Operator { name: "$lt", arity: Arity::Exact(2), eval: |a, c| compare(a, c, |o| o.is_lt()) },
    Operator { name: "$lte", arity: Arity::Exact(2), eval: |a, c| compare(a, c, |o| o.is_le()) },
    Operator { name: "$cmp", arity: Arity::Exact(2), eval: cmp },
    Operator { name: "$and", arity: Arity::AtLeast(0), eval: |a, _| Ok(Bson::Boolean(a.iter().all(is_truthy))) },
    Operator { name: "$or", arity: Arity::AtLeast(0), eval: |a, _| Ok(Bson::Boolean(a.iter().any(is_truthy))) },
    Operator { name: "$not", arity: Arity::Exact(1), eval: |a, _| Ok(Bson::Boolean(!is_truthy(&a[0]))) },
    Operator { name: "$cond", arity: Arity::Exact(3), eval: cond },
    Operator { name: "$ifNull", arity: Arity::AtLeast(2), eval: if_null },
    Operator { name: "$concat", arity: Arity::AtLeast(0), eval: concat },
    Operator { name: "$toUpper", arity: Arity::Exact(1), eval: |a, _| change_case(&a[0], str::to_uppercase) },
    Operator { name: "$toLower", arity: Arity::Exact(1), eval: |a, _| change_case(&a[0], str::to_lowercase) },
    Operator { name: "$size", arity: Arity::Exact(1), eval: size },
    Operator { name: "$concatArrays", arity: Arity::AtLeast(0), eval: concat_arrays },
    Operator { name: "$in", arity: Arity::Exact(2), eval: contains },
    Operator { name: "$arrayElemAt", arity: Arity::Exact(2), eval: array_elem_at },
    Operator { name: "$min", arity: Arity::AtLeast(1), eval: |a, c| extreme(a, c, |o| o.is_lt()) },
    Operator { name: "$max", arity: Arity::AtLeast(1), eval: |a, c| extreme(a, c, |o| o.is_gt()) },
];

static OPERATORS: LazyLock<HashMap<&'static str, &'static Operator>> =
    LazyLock::new(|| OPERATOR_TABLE.iter().map(|op| (op.name, op)).collect());

// ── Parsing ─────────────────────────────────────────────────────

impl Expr {
    pub fn parse(value: &Bson) -> Result<Expr, QueryError> {
        match value {
            Bson::String(s) if s.starts_with("$$") => parse_variable(s),
            Bson::String(s) if s.starts_with('$') => {
                if s.len() == 1 {
                    return Err(QueryError::InvalidExpression("empty field path".into()));
                }
                Ok(Expr::Field(s[1..].to_string()))
            }
            Bson::Document(doc) => Self::parse_document(doc),
            Bson::Array(items) => Ok(Expr::Array(
                items.iter().map(Expr::parse).collect::<Result<_, _>>()?,
            )),
            other => Ok(Expr::Literal(other.clone())),
        }
    }

    fn parse_document(doc: &Document) -> Result<Expr, QueryError> {
        let Some(first) = doc.keys().next() else {
            return Ok(Expr::Object(Vec::new()));
        };
        if !first.starts_with('$') {
            return doc
                .iter()
                .map(|(k, v)| {
                    if k.starts_with('$') {
                        return Err(QueryError::InvalidExpression(format!(
                            "field name {k} cannot start with '$' inside an object"
                        )));
                    }
                    Ok((k.clone(), Expr::parse(v)?))
                })
                .collect::<Result<_, _>>()
                .map(Expr::Object);
        }
        if doc.len() != 1 {
            return Err(QueryError::InvalidExpression(format!(
                "an expression object must have exactly one field, found {}",
                doc.len()
            )));
        }
        let (name, operand) = doc.iter().next().map(|(k, v)| (k.as_str(), v)).ok_or_else(|| {
            QueryError::InvalidExpression("empty expression object".into())
        })?;
        if name == "$literal" {
            return Ok(Expr::Literal(operand.clone()));
        }
        let op = *OPERATORS
            .get(name)
            .ok_or_else(|| QueryError::UnknownOperator(name.to_string()))?;
        let args = parse_operands(op, operand)?;
        let ok = match op.arity {
            Arity::Exact(n) => args.len() == n,
            Arity::AtLeast(n) => args.len() >= n,
        };
        if !ok {
            return Err(QueryError::InvalidExpression(format!(
                "{name} takes {:?} arguments, got {}",
                op.arity,
                args.len()
            )));
        }
        Ok(Expr::Operator(op, args))
    }

    /// The path of a bare `"$field"` expression.
    pub fn field_path(&self) -> Option<&str> {
        match self {
            Expr::Field(path) => Some(path),
            _ => None,
        }
    }
}

fn parse_variable(s: &str) -> Result<Expr, QueryError> {
    let (name, path) = match s[2..].split_once('.') {
        Some((name, path)) => (name, Some(path.to_string())),
        None => (&s[2..], None),
    };
    match name {
        "ROOT" | "CURRENT" => Ok(Expr::Root(path)),
        _ => Err(QueryError::InvalidExpression(format!(
            "use of undefined variable: {name}"
        ))),
    }
}

fn parse_operands(op: &Operator, operand: &Bson) -> Result<Vec<Expr>, QueryError> {
    match operand {
        Bson::Array(items) => items.iter().map(Expr::parse).collect(),
        // `$cond` also accepts `{ if, then, else }`.
        Bson::Document(doc) if op.name == "$cond" && doc.contains_key("if") => {
            ["if", "then", "else"]
                .iter()
                .map(|key| match doc.get(*key) {
                    Some(v) => Expr::parse(v),
                    None => Err(QueryError::InvalidExpression(format!(
                        "$cond is missing '{key}'"
                    ))),
                })
                .collect()
        }
        single => Ok(vec![Expr::parse(single)?]),
    }
}

// ── Evaluation ──────────────────────────────────────────────────

impl Expr {
    /// Evaluate against `doc`. `None` means the result is missing.
    pub fn eval(
        &self,
        doc: &Document,
        collation: Option<&Collation>,
    ) -> Result<Option<Bson>, QueryError> {
        match self {
            Expr::Literal(v) => Ok(Some(v.clone())),
            Expr::Field(path) => Ok(resolve_path(doc, path)),
            Expr::Root(None) => Ok(Some(Bson::Document(doc.clone()))),
            Expr::Root(Some(path)) => Ok(resolve_path(doc, path)),
            Expr::Object(fields) => {
                let mut out = Document::new();
                for (key, expr) in fields {
                    if let Some(v) = expr.eval(doc, collation)? {
                        out.insert(key.clone(), v);
                    }
                }
                Ok(Some(Bson::Document(out)))
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.eval(doc, collation)?.unwrap_or(Bson::Null));
                }
                Ok(Some(Bson::Array(out)))
            }
            Expr::Operator(op, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(arg.eval(doc, collation)?.unwrap_or(Bson::Null));
                }
                (op.eval)(&values, collation).map(Some)
            }
        }
    }

    /// Evaluate, treating missing as null.
    pub fn eval_or_null(
        &self,
        doc: &Document,
        collation: Option<&Collation>,
    ) -> Result<Bson, QueryError> {
        Ok(self.eval(doc, collation)?.unwrap_or(Bson::Null))
    }
}

// ── Operators ───────────────────────────────────────────────────

fn number(op: &str, value: &Bson) -> Result<Number, QueryError> {
    Number::from_bson(value).ok_or_else(|| {
        QueryError::Evaluation(format!(
            "{op} only supports numeric types, not {}",
            type_name(value)
        ))
    })
}

fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Double(_) => "double",
        Bson::String(_) => "string",
        Bson::Document(_) => "object",
        Bson::Array(_) => "array",
        Bson::Boolean(_) => "bool",
        Bson::Null => "null",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::DateTime(_) => "date",
        Bson::ObjectId(_) => "objectId",
        _ => "other",
    }
}

fn add(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    if args.iter().any(is_nullish) {
        return Ok(Bson::Null);
    }
    let mut total = Number::Int32(0);
    let mut date: Option<bson::DateTime> = None;
    for arg in args {
        match arg {
            Bson::DateTime(d) if date.is_none() => date = Some(*d),
            Bson::DateTime(_) => {
                return Err(QueryError::Evaluation("only one date allowed in an $add".into()));
            }
            other => total = total.add(number("$add", other)?),
        }
    }
    Ok(match date {
        Some(d) => shift_date("$add", d, date_offset("$add", total)?)?,
        None => total.to_bson(),
    })
}

fn subtract(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    match (&args[0], &args[1]) {
        (a, b) if is_nullish(a) || is_nullish(b) => Ok(Bson::Null),
        (Bson::DateTime(a), Bson::DateTime(b)) => a
            .timestamp_millis()
            .checked_sub(b.timestamp_millis())
            .map(Bson::Int64)
            .ok_or_else(|| date_overflow("$subtract")),
        (Bson::DateTime(a), b) => {
            let offset = date_offset("$subtract", number("$subtract", b)?)?;
            let negated = offset.checked_neg().ok_or_else(|| date_overflow("$subtract"))?;
            shift_date("$subtract", *a, negated)
        }
        (a, b) => Ok(number("$subtract", a)?.sub(number("$subtract", b)?).to_bson()),
    }
}

/// Milliseconds to move a date by, rounded to the nearest integer.
fn date_offset(op: &str, n: Number) -> Result<i64, QueryError> {
    match n {
        Number::Double(f) => {
            let ms = f.round();
            // i64::MAX as f64 rounds up to 2^63, which is already out of range.
            if ms.is_finite() && ms >= i64::MIN as f64 && ms < i64::MAX as f64 {
                Ok(ms as i64)
            } else {
                Err(date_overflow(op))
            }
        }
        other => Ok(other.as_i64()),
    }
}

fn shift_date(op: &str, date: bson::DateTime, offset: i64) -> Result<Bson, QueryError> {
    date.timestamp_millis()
        .checked_add(offset)
        .map(|ms| Bson::DateTime(bson::DateTime::from_millis(ms)))
        .ok_or_else(|| date_overflow(op))
}

fn date_overflow(op: &str) -> QueryError {
    QueryError::Evaluation(format!("date overflow in {op}"))
}

fn multiply(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    if args.iter().any(is_nullish) {
        return Ok(Bson::Null);
    }
    let mut product = Number::Int32(1);
    for arg in args {
        product = product.mul(number("$multiply", arg)?);
    }
    Ok(product.to_bson())
}

fn divide(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    if args.iter().any(is_nullish) {
        return Ok(Bson::Null);
    }
    let dividend = number("$divide", &args[0])?.as_f64();
    let divisor = number("$divide", &args[1])?.as_f64();
    if divisor == 0.0 {
        return Err(QueryError::Evaluation("can't $divide by zero".into()));
    }
    Ok(Bson::Double(dividend / divisor))
}

fn modulo(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    if args.iter().any(is_nullish) {
        return Ok(Bson::Null);
    }
    match (number("$mod", &args[0])?, number("$mod", &args[1])?) {
        (_, Number::Int32(0)) | (_, Number::Int64(0)) => {
            Err(QueryError::Evaluation("can't $mod by zero".into()))
        }
        (Number::Int32(a), Number::Int32(b)) => Ok(Bson::Int32(a.wrapping_rem(b))),
        (a @ (Number::Int32(_) | Number::Int64(_)), b @ (Number::Int32(_) | Number::Int64(_))) => {
            Ok(Bson::Int64(a.as_i64().wrapping_rem(b.as_i64())))
        }
        (a, b) => {
            if b.as_f64() == 0.0 {
                return Err(QueryError::Evaluation("can't $mod by zero".into()));
            }
            Ok(Bson::Double(a.as_f64() % b.as_f64()))
        }
    }
}

fn compare(
    args: &[Bson],
    collation: Option<&Collation>,
    predicate: fn(std::cmp::Ordering) -> bool,
) -> Result<Bson, QueryError> {
    Ok(Bson::Boolean(predicate(compare_values(&args[0], &args[1], collation))))
}

fn cmp(args: &[Bson], collation: Option<&Collation>) -> Result<Bson, QueryError> {
    Ok(Bson::Int32(compare_values(&args[0], &args[1], collation) as i32))
}

fn cond(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    Ok(if is_truthy(&args[0]) {
        args[1].clone()
    } else {
        args[2].clone()
    })
}

fn if_null(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    let (last, rest) = args
        .split_last()
        .ok_or_else(|| QueryError::Evaluation("$ifNull needs arguments".into()))?;
    Ok(rest
        .iter()
        .find(|v| !is_nullish(v))
        .unwrap_or(last)
        .clone())
}

fn concat(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    let mut out = String::new();
    for arg in args {
        match arg {
            Bson::String(s) => out.push_str(s),
            v if is_nullish(v) => return Ok(Bson::Null),
            other => {
                return Err(QueryError::Evaluation(format!(
                    "$concat only supports strings, not {}",
                    type_name(other)
                )));
            }
        }
    }
    Ok(Bson::String(out))
}

fn change_case(value: &Bson, f: fn(&str) -> String) -> Result<Bson, QueryError> {
    match value {
        Bson::String(s) => Ok(Bson::String(f(s))),
        v if is_nullish(v) => Ok(Bson::String(String::new())),
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Ok(Bson::String(value.to_string())),
        other => Err(QueryError::Evaluation(format!(
            "can't convert {} to a string",
            type_name(other)
        ))),
    }
}

fn size(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    match &args[0] {
        Bson::Array(items) => Ok(Bson::Int32(items.len() as i32)),
        other => Err(QueryError::Evaluation(format!(
            "the argument to $size must be an array, not {}",
            type_name(other)
        ))),
    }
}

fn concat_arrays(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    let mut out = Vec::new();
    for arg in args {
        match arg {
            Bson::Array(items) => out.extend(items.iter().cloned()),
            v if is_nullish(v) => return Ok(Bson::Null),
            other => {
                return Err(QueryError::Evaluation(format!(
                    "$concatArrays only supports arrays, not {}",
                    type_name(other)
                )));
            }
        }
    }
    Ok(Bson::Array(out))
}

fn contains(args: &[Bson], collation: Option<&Collation>) -> Result<Bson, QueryError> {
    match &args[1] {
        Bson::Array(items) => Ok(Bson::Boolean(items.iter().any(|item| {
            compare_values(item, &args[0], collation).is_eq()
        }))),
        other => Err(QueryError::Evaluation(format!(
            "$in requires an array as a second argument, found: {}",
            type_name(other)
        ))),
    }
}

fn array_elem_at(args: &[Bson], _: Option<&Collation>) -> Result<Bson, QueryError> {
    let items = match &args[0] {
        Bson::Array(items) => items,
        v if is_nullish(v) => return Ok(Bson::Null),
        other => {
            return Err(QueryError::Evaluation(format!(
                "$arrayElemAt's first argument must be an array, not {}",
                type_name(other)
            )));
        }
    };
    let index = crate::value::as_i64(&args[1]).ok_or_else(|| {
        QueryError::Evaluation("$arrayElemAt's second argument must be an integer".into())
    })?;
    let position = if index < 0 {
        items.len() as i64 + index
    } else {
        index
    };
    Ok(usize::try_from(position)
        .ok()
        .and_then(|i| items.get(i))
        .cloned()
        .unwrap_or(Bson::Null))
}

/// `$min` / `$max`: a single array argument is searched element-wise;
/// nulls are ignored.
fn extreme(
    args: &[Bson],
    collation: Option<&Collation>,
    better: fn(std::cmp::Ordering) -> bool,
) -> Result<Bson, QueryError> {
    let values: &[Bson] = match args {
        [Bson::Array(items)] => items,
        _ => args,
    };
    let mut best: Option<&Bson> = None;
    for v in values.iter().filter(|v| !is_nullish(v)) {
        if best.is_none_or(|b| better(compare_values(v, b, collation))) {
            best = Some(v);
        }
    }
    Ok(best.cloned().unwrap_or(Bson::Null))
}
