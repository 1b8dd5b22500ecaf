//! Condition priority table.
//!
//! The table is a plain text file with one `<condition>:<priority>` rule per
//! line. Lines starting with `#` are comments and blank lines are skipped:
//!
//! ```text
//! # node level
//! NodeNotReady:0
//! NodeCordon:1
//! GpuDown:10
//! XIDApplicationErr:999
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use thiserror::Error;
use tracing::debug;

/// Priority anchors partitioning conditions into buckets.
pub struct Priority;

impl Priority {
    pub const NODE_NOT_READY: i32 = 0;
    pub const NODE_CORDON: i32 = 1;
    pub const EMERGENCY: i32 = 99;
    pub const CAN_IGNORE: i32 = 999;
    pub const MUST_IGNORE: i32 = 9999;
}

#[derive(Error, Debug)]
pub enum PriorityError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config at line {line}: {content:?}")]
    InvalidConfig { line: usize, content: String },
}

/// Mapping of condition name to priority.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityTable {
    priorities: BTreeMap<String, i32>,
}

impl PriorityTable {
    /// Parse the textual format. Any malformed line rejects the whole table.
    pub fn parse(content: &str) -> Result<Self, PriorityError> {
        let mut priorities = BTreeMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let invalid = || PriorityError::InvalidConfig {
                line: idx + 1,
                content: raw.to_string(),
            };

            let (name, value) = line.split_once(':').ok_or_else(invalid)?;
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid());
            }
            let value = value.trim().parse::<i32>().map_err(|_| invalid())?;

            priorities.insert(name.to_string(), value);
        }

        debug!(rules = priorities.len(), "Parsed priority table");
        Ok(Self { priorities })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PriorityError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| PriorityError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Priority of `condition`; unknown conditions are `CAN_IGNORE`.
    pub fn priority_of(&self, condition: &str) -> i32 {
        self.priorities
            .get(condition)
            .copied()
            .unwrap_or(Priority::CAN_IGNORE)
    }

    pub fn insert(&mut self, condition: impl Into<String>, priority: i32) {
        self.priorities.insert(condition.into(), priority);
    }

    pub fn len(&self) -> usize {
        self.priorities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    /// Render the table canonically, one rule per line sorted by condition.
    pub fn to_config_string(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.priorities {
            let _ = writeln!(out, "{name}:{value}");
        }
        out
    }
}

impl<S: Into<String>> FromIterator<(S, i32)> for PriorityTable {
    fn from_iter<T: IntoIterator<Item = (S, i32)>>(iter: T) -> Self {
        Self {
            priorities: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
