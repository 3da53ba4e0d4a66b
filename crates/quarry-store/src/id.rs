use bson::{Bson, Document};

/// Returns the `_id` of a document, if present.
pub fn document_id(doc: &Document) -> Option<&Bson> {
    doc.get("_id")
}

/// Canonical string form of an `_id` value, used for set membership.
///
/// Numerically equal ids share a key regardless of their BSON width
/// (`1_i32`, `1_i64` and `1.0` all map to `n:1`).
pub fn id_key(id: &Bson) -> String {
    let mut out = String::new();
    write_key(id, &mut out);
    out
}

fn write_key(value: &Bson, out: &mut String) {
    match value {
        Bson::Int32(n) => {
            out.push_str("n:");
            out.push_str(&n.to_string());
        }
        Bson::Int64(n) => {
            out.push_str("n:");
            out.push_str(&n.to_string());
        }
        Bson::Double(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
            out.push_str("n:");
            out.push_str(&(*f as i64).to_string());
        }
        Bson::Double(f) => {
            out.push_str("d:");
            out.push_str(&f.to_string());
        }
        Bson::String(s) => {
            out.push_str("s:");
            out.push_str(&s.len().to_string());
            out.push(':');
            out.push_str(s);
        }
        Bson::ObjectId(oid) => {
            out.push_str("o:");
            out.push_str(&oid.to_hex());
        }
        Bson::Boolean(b) => out.push_str(if *b { "b:1" } else { "b:0" }),
        Bson::Null => out.push_str("null"),
        Bson::DateTime(dt) => {
            out.push_str("t:");
            out.push_str(&dt.timestamp_millis().to_string());
        }
        Bson::Document(doc) => {
            out.push('{');
            for (k, v) in doc {
                out.push_str(&k.len().to_string());
                out.push(':');
                out.push_str(k);
                out.push('=');
                write_key(v, out);
                out.push(',');
            }
            out.push('}');
        }
        Bson::Array(items) => {
            out.push('[');
            for v in items {
                write_key(v, out);
                out.push(',');
            }
            out.push(']');
        }
        other => {
            out.push_str("x:");
            out.push_str(&other.to_string());
        }
    }
}
