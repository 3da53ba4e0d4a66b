use std::cmp::Ordering;

use bson::Bson;

use crate::collation::{Collation, folds_case};

// ── Type order ──────────────────────────────────────────────────

/// Position of a value's type in the MongoDB cross-type sort order.
/// Values of different types compare by this rank alone.
pub(crate) fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 1,
        Bson::Null | Bson::Undefined => 2,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 3,
        Bson::String(_) | Bson::Symbol(_) => 4,
        Bson::Document(_) => 5,
        Bson::Array(_) => 6,
        Bson::Binary(_) => 7,
        Bson::ObjectId(_) => 8,
        Bson::Boolean(_) => 9,
        Bson::DateTime(_) => 10,
        Bson::Timestamp(_) => 11,
        Bson::RegularExpression(_) => 12,
        Bson::MaxKey => 14,
        _ => 13,
    }
}

/// Total order over BSON values: type rank first, then value.
pub fn compare_values(a: &Bson, b: &Bson, collation: Option<&Collation>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => compare_strings(x, y, collation),
        (Bson::Symbol(x), Bson::Symbol(y)) => compare_strings(x, y, collation),
        (Bson::String(x), Bson::Symbol(y)) | (Bson::Symbol(x), Bson::String(y)) => {
            compare_strings(x, y, collation)
        }
        (Bson::Document(x), Bson::Document(y)) => {
            let mut xs = x.iter();
            let mut ys = y.iter();
            loop {
                match (xs.next(), ys.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some((kx, vx)), Some((ky, vy))) => {
                        let ord = type_rank(vx)
                            .cmp(&type_rank(vy))
                            .then_with(|| kx.cmp(ky))
                            .then_with(|| compare_values(vx, vy, collation));
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                }
            }
        }
        (Bson::Array(x), Bson::Array(y)) => {
            for (vx, vy) in x.iter().zip(y.iter()) {
                let ord = compare_values(vx, vy, collation);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Binary(x), Bson::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then_with(|| x.bytes.cmp(&y.bytes)),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => {
            x.timestamp_millis().cmp(&y.timestamp_millis())
        }
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            (x.time, x.increment).cmp(&(y.time, y.increment))
        }
        _ if ra == 3 => compare_numbers(a, b),
        // Same rank, no natural order (null, min/max key, code): equal
        // when their printed forms agree.
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Equality under the total order, so `1`, `1i64` and `1.0` are equal.
pub fn values_equal(a: &Bson, b: &Bson, collation: Option<&Collation>) -> bool {
    compare_values(a, b, collation) == Ordering::Equal
}

fn compare_strings(a: &str, b: &str, collation: Option<&Collation>) -> Ordering {
    if folds_case(collation) {
        a.to_lowercase().cmp(&b.to_lowercase())
    } else {
        a.cmp(b)
    }
}

fn compare_numbers(a: &Bson, b: &Bson) -> Ordering {
    match (Number::from_bson(a), Number::from_bson(b)) {
        (Some(Number::Double(x)), Some(y)) => compare_f64(x, y.as_f64()),
        (Some(x), Some(Number::Double(y))) => compare_f64(x.as_f64(), y),
        (Some(x), Some(y)) => x.as_i64().cmp(&y.as_i64()),
        // Decimal128 has no arithmetic here; order by printed form.
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// NaN sorts below every other number.
fn compare_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

// ── Truthiness ──────────────────────────────────────────────────

/// `false`, `null`, missing and numeric zero are false; everything else is true.
pub fn is_truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Null | Bson::Undefined => false,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        _ => true,
    }
}

pub(crate) fn is_nullish(value: &Bson) -> bool {
    matches!(value, Bson::Null | Bson::Undefined)
}

// ── Numbers ─────────────────────────────────────────────────────

pub(crate) fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(*n as i64),
        Bson::Int64(n) => Some(*n),
        Bson::Double(n) if n.fract() == 0.0 && n.is_finite() => Some(*n as i64),
        _ => None,
    }
}

/// Numeric value with MongoDB's result-widening rules: int32 widens to
/// int64 on overflow, anything mixed with a double becomes a double.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Number {
    Int32(i32),
    Int64(i64),
    Double(f64),
}

impl Number {
    pub(crate) fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Int32(n) => Some(Number::Int32(*n)),
            Bson::Int64(n) => Some(Number::Int64(*n)),
            Bson::Double(n) => Some(Number::Double(*n)),
            _ => None,
        }
    }

    pub(crate) fn to_bson(self) -> Bson {
        match self {
            Number::Int32(n) => Bson::Int32(n),
            Number::Int64(n) => Bson::Int64(n),
            Number::Double(n) => Bson::Double(n),
        }
    }

    pub(crate) fn as_f64(self) -> f64 {
        match self {
            Number::Int32(n) => n as f64,
            Number::Int64(n) => n as f64,
            Number::Double(n) => n,
        }
    }

    pub(crate) fn as_i64(self) -> i64 {
        match self {
            Number::Int32(n) => n as i64,
            Number::Int64(n) => n,
            Number::Double(n) => n as i64,
        }
    }

    pub(crate) fn add(self, other: Number) -> Number {
        self.combine(other, i32::checked_add, i64::checked_add, |a, b| a + b)
    }

    pub(crate) fn sub(self, other: Number) -> Number {
        self.combine(other, i32::checked_sub, i64::checked_sub, |a, b| a - b)
    }

    pub(crate) fn mul(self, other: Number) -> Number {
        self.combine(other, i32::checked_mul, i64::checked_mul, |a, b| a * b)
    }

    fn combine(
        self,
        other: Number,
        narrow: fn(i32, i32) -> Option<i32>,
        wide: fn(i64, i64) -> Option<i64>,
        float: fn(f64, f64) -> f64,
    ) -> Number {
        match (self, other) {
            (Number::Double(_), _) | (_, Number::Double(_)) => {
                Number::Double(float(self.as_f64(), other.as_f64()))
            }
            (Number::Int32(a), Number::Int32(b)) => match narrow(a, b) {
                Some(n) => Number::Int32(n),
                None => Number::Int64(wide(a as i64, b as i64).unwrap_or_default()),
            },
            _ => match wide(self.as_i64(), other.as_i64()) {
                Some(n) => Number::Int64(n),
                None => Number::Double(float(self.as_f64(), other.as_f64())),
            },
        }
    }
}

// ── Hash keys ───────────────────────────────────────────────────

/// Canonical string for grouping and set membership. Values equal under
/// [`values_equal`] produce the same key.
pub fn hash_key(value: &Bson, collation: Option<&Collation>) -> String {
    let mut out = String::new();
    write_key(value, collation, &mut out);
    out
}

fn write_key(value: &Bson, collation: Option<&Collation>, out: &mut String) {
    match value {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => {
            match Number::from_bson(value) {
                Some(Number::Double(f)) if f.fract() != 0.0 || !f.is_finite() => {
                    out.push_str(&format!("n:{f}"));
                }
                Some(n) => out.push_str(&format!("n:{}", n.as_f64() as i64)),
                None => {}
            }
        }
        Bson::String(s) | Bson::Symbol(s) => {
            let s = if folds_case(collation) {
                s.to_lowercase()
            } else {
                s.clone()
            };
            out.push_str(&format!("s:{}:{s}", s.len()));
        }
        Bson::Null | Bson::Undefined => out.push_str("null"),
        Bson::Document(doc) => {
            out.push('{');
            for (k, v) in doc {
                out.push_str(&format!("{}:{k}=", k.len()));
                write_key(v, collation, out);
                out.push(',');
            }
            out.push('}');
        }
        Bson::Array(items) => {
            out.push('[');
            for v in items {
                write_key(v, collation, out);
                out.push(',');
            }
            out.push(']');
        }
        other => out.push_str(&format!("{}:{other}", type_rank(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn numbers_compare_across_widths() {
        assert!(values_equal(&Bson::Int32(1), &Bson::Double(1.0), None));
        assert!(values_equal(&Bson::Int64(7), &Bson::Int32(7), None));
        assert_eq!(
            compare_values(&Bson::Int32(2), &Bson::Double(2.5), None),
            Ordering::Less
        );
    }

    #[test]
    fn types_order_by_rank() {
        let ordered = [
            Bson::MinKey,
            Bson::Null,
            Bson::Int32(5),
            Bson::String("a".into()),
            Bson::Document(doc! {}),
            Bson::Array(vec![]),
            Bson::ObjectId(bson::oid::ObjectId::new()),
            Bson::Boolean(false),
            Bson::DateTime(bson::DateTime::from_millis(0)),
            Bson::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1], None), Ordering::Less);
        }
    }

    #[test]
    fn collation_folds_case() {
        let ci = Collation {
            locale: "en".into(),
            strength: 2,
        };
        let a = Bson::String("Apple".into());
        let b = Bson::String("apple".into());
        assert!(!values_equal(&a, &b, None));
        assert!(values_equal(&a, &b, Some(&ci)));
        assert_eq!(hash_key(&a, Some(&ci)), hash_key(&b, Some(&ci)));
    }

    #[test]
    fn int32_addition_widens_on_overflow() {
        let sum = Number::Int32(i32::MAX).add(Number::Int32(1));
        assert_eq!(sum, Number::Int64(i32::MAX as i64 + 1));
        assert_eq!(
            Number::Int32(2).mul(Number::Double(1.5)),
            Number::Double(3.0)
        );
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(&Bson::Int32(0)));
        assert!(!is_truthy(&Bson::Null));
        assert!(is_truthy(&Bson::String(String::new())));
        assert!(is_truthy(&Bson::Array(vec![])));
    }

    #[test]
    fn hash_keys_unify_numeric_widths() {
        assert_eq!(
            hash_key(&Bson::Int32(3), None),
            hash_key(&Bson::Double(3.0), None)
        );
        assert_ne!(
            hash_key(&Bson::Int32(3), None),
            hash_key(&Bson::String("3".into()), None)
        );
    }
}
