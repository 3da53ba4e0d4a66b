use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::QueryError;

/// String comparison rules for `$sort`, filters and grouping.
///
/// Only `strength` is interpreted: 1 and 2 compare strings without regard
/// to case, 3 (the default) compares them exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    pub strength: u8,
}

impl Default for Collation {
    fn default() -> Self {
        Self {
            locale: "simple".to_string(),
            strength: 3,
        }
    }
}

impl Collation {
    pub fn from_document(doc: &Document) -> Result<Self, QueryError> {
        let locale = match doc.get("locale") {
            Some(Bson::String(s)) => s.clone(),
            Some(_) => return Err(QueryError::InvalidStage("collation locale must be a string".into())),
            None => return Err(QueryError::InvalidStage("collation requires a locale".into())),
        };
        let strength = match doc.get("strength") {
            None => 3,
            Some(v) => match crate::value::as_i64(v) {
                Some(n @ 1..=5) => n as u8,
                _ => {
                    return Err(QueryError::InvalidStage(
                        "collation strength must be an integer between 1 and 5".into(),
                    ));
                }
            },
        };
        Ok(Self { locale, strength })
    }

    pub fn ignores_case(&self) -> bool {
        self.strength <= 2
    }
}

/// True when `collation` asks for case-insensitive string comparison.
pub(crate) fn folds_case(collation: Option<&Collation>) -> bool {
    collation.is_some_and(Collation::ignores_case)
}
