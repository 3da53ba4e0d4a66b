use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Documents returned in a first batch or `getMore` when the command
    /// names no `batchSize`.
    pub default_batch_size: usize,
    /// Upper bound applied to any requested batch size.
    pub max_batch_size: Option<usize>,
    /// `ordered` for insert/update/delete commands that omit it.
    pub ordered_writes_by_default: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 101,
            max_batch_size: None,
            ordered_writes_by_default: false,
        }
    }
}

impl DatabaseConfig {
    pub fn batch_size(&self, requested: Option<usize>) -> usize {
        let size = requested.unwrap_or(self.default_batch_size);
        match self.max_batch_size {
            Some(max) => size.min(max),
            None => size,
        }
    }
}
