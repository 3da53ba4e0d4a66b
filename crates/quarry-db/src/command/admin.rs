use std::sync::Arc;

use bson::{Document, doc};
use quarry_store::{ChangeStreamDocument, CreateOptions, Namespace};

use super::{Create, DropCollection};
use crate::analysis::QueryAnalysis;
use crate::database::Database;
use crate::error::DbError;
use crate::view::View;

pub(crate) fn create(db: &Database, name: &str, cmd: Create) -> Result<Document, DbError> {
    let _admin = db.admin_lock();
    let ns = Namespace::new(name, cmd.coll.as_str());
    if db.views().contains(&ns) {
        return Err(DbError::NamespaceExists(ns));
    }

    match cmd.view_on {
        Some(source) => {
            let view_on = ns.sibling(source);
            check_view_source(db, &ns, &view_on)?;
            let analysis = QueryAnalysis::new(name, cmd.pipeline.clone(), None)?;
            if analysis.sink_target().is_some() {
                return Err(DbError::BadValue(
                    "$out and $merge are not allowed in a view definition".into(),
                ));
            }

            let view = View::create(
                ns.clone(),
                view_on.clone(),
                cmd.pipeline,
                Arc::clone(db.engine()),
                Arc::clone(db.bus()),
            )?;
            db.views().insert(Arc::new(view));
            tracing::info!(ns = %ns, view_on = %view_on, "created view");
        }
        None => {
            if !cmd.pipeline.is_empty() {
                return Err(DbError::BadValue("pipeline requires viewOn".into()));
            }
            db.storage(name)?
                .create_collection(&ns.coll, &CreateOptions { options: cmd.options })?;
            tracing::info!(ns = %ns, "created collection");
        }
    }
    Ok(doc! { "ok": 1 })
}

pub(crate) fn drop(db: &Database, name: &str, cmd: DropCollection) -> Result<Document, DbError> {
    let _admin = db.admin_lock();
    let ns = Namespace::new(name, cmd.coll.as_str());

    match db.views().remove(&ns) {
        Some(view) => {
            view.stop();
            tracing::info!(ns = %ns, "dropped view");
        }
        None => {
            db.storage(name)?.drop_collection(&ns.coll)?;
            tracing::info!(ns = %ns, "dropped collection");
        }
    }
    db.bus().publish(&ChangeStreamDocument::drop(ns.clone()));
    Ok(doc! { "ns": ns.to_string(), "ok": 1 })
}

/// Rejects a view over itself, directly or through other views.
fn check_view_source(db: &Database, ns: &Namespace, view_on: &Namespace) -> Result<(), DbError> {
    let mut current = view_on.clone();
    loop {
        if current == *ns {
            return Err(DbError::BadValue(format!(
                "view {ns} would depend on itself through {view_on}"
            )));
        }
        match db.views().get(&current) {
            Some(view) => current = view.view_on().clone(),
            None => return Ok(()),
        }
    }
}
