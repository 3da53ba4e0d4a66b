use bson::{Bson, Document, doc};
use quarry_store::{Namespace, WriteError};

/// `{cursor: {<batch_key>: [...], id, ns}, ok: 1}`.
pub(crate) fn cursor_reply(batch_key: &str, batch: Vec<Document>, id: i64, ns: &Namespace) -> Document {
    let batch: Vec<Bson> = batch.into_iter().map(Bson::Document).collect();
    doc! {
        "cursor": {
            batch_key: batch,
            "id": id,
            "ns": ns.to_string(),
        },
        "ok": 1,
    }
}

/// A count as Int32 when it fits, Int64 otherwise.
pub(crate) fn count(n: u64) -> Bson {
    match i32::try_from(n) {
        Ok(n) => Bson::Int32(n),
        Err(_) => Bson::Int64(n as i64),
    }
}

/// Outcome of an insert, update or delete command.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct WriteResult {
    pub n: u64,
    /// Only reported by `update`.
    pub n_modified: Option<u64>,
    pub upserted: Vec<Document>,
    pub write_errors: Vec<WriteError>,
}

impl WriteResult {
    pub(crate) fn record_error(&mut self, error: WriteError, ns: &Namespace) {
        tracing::warn!(
            ns = %ns,
            index = error.index,
            code = error.code,
            errmsg = %error.errmsg,
            "write error"
        );
        self.write_errors.push(error);
    }

    pub(crate) fn to_document(&self) -> Document {
        let mut reply = doc! { "n": count(self.n) };
        if let Some(modified) = self.n_modified {
            reply.insert("nModified", count(modified));
        }
        if !self.upserted.is_empty() {
            reply.insert("upserted", self.upserted.clone());
        }
        if !self.write_errors.is_empty() {
            let errors: Vec<Document> = self.write_errors.iter().map(WriteError::to_document).collect();
            reply.insert("writeErrors", errors);
        }
        reply.insert("ok", 1);
        reply
    }
}
