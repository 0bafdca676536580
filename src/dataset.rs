//! Explicit dataset selection passed into every store and engine call.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const SALES_TABLE_SUFFIX: &str = "_Sales";
const DATASET_PREFIX: &str = "ROA1_";
const MAX_IDENTIFIER_LEN: usize = 64;
/// Feed table used when no dataset is configured.
pub const DEFAULT_FEED_TABLE: &str = "ROA1_NL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DatasetError {
    #[error("invalid table identifier '{0}': only ASCII letters, digits and '_' are allowed")]
    InvalidIdentifier(String),
}

/// A feed table and the sales table it is linked to.
///
/// Table names are interpolated into SQL, so both are validated on
/// construction and cannot be changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetHandle {
    feed_table: String,
    sales_table: String,
}

impl DatasetHandle {
    /// Dataset whose sales table follows the `<feed>_Sales` convention.
    pub fn new(feed_table: &str) -> Result<Self, DatasetError> {
        let feed_table = validate_identifier(feed_table)?;
        let sales_table = format!("{feed_table}{SALES_TABLE_SUFFIX}");
        Ok(Self {
            feed_table,
            sales_table,
        })
    }

    pub fn with_sales_table(feed_table: &str, sales_table: &str) -> Result<Self, DatasetError> {
        Ok(Self {
            feed_table: validate_identifier(feed_table)?,
            sales_table: validate_identifier(sales_table)?,
        })
    }

    pub fn feed_table(&self) -> &str {
        &self.feed_table
    }

    pub fn sales_table(&self) -> &str {
        &self.sales_table
    }

    /// Short name used in cache file names, e.g. `ROA1_NL` -> `NL`.
    pub fn suffix(&self) -> &str {
        self.feed_table
            .strip_prefix(DATASET_PREFIX)
            .filter(|rest| !rest.is_empty())
            .unwrap_or(&self.feed_table)
    }
}

impl Default for DatasetHandle {
    fn default() -> Self {
        Self {
            feed_table: DEFAULT_FEED_TABLE.to_string(),
            sales_table: format!("{DEFAULT_FEED_TABLE}{SALES_TABLE_SUFFIX}"),
        }
    }
}

impl fmt::Display for DatasetHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.feed_table)
    }
}

fn validate_identifier(raw: &str) -> Result<String, DatasetError> {
    let trimmed = raw.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_IDENTIFIER_LEN
        && trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        && !trimmed.as_bytes()[0].is_ascii_digit();

    if valid {
        Ok(trimmed.to_string())
    } else {
        Err(DatasetError::InvalidIdentifier(raw.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sales_table_follows_naming_convention() {
        let ds = DatasetHandle::new("ROA1_NL").unwrap();
        assert_eq!(ds.feed_table(), "ROA1_NL");
        assert_eq!(ds.sales_table(), "ROA1_NL_Sales");
        assert_eq!(ds.suffix(), "NL");
    }

    #[test]
    fn default_dataset_is_a_valid_identifier() {
        assert_eq!(DatasetHandle::default(), DatasetHandle::new(DEFAULT_FEED_TABLE).unwrap());
    }

    #[test]
    fn suffix_keeps_names_without_prefix() {
        let ds = DatasetHandle::new("traffic_fr").unwrap();
        assert_eq!(ds.suffix(), "traffic_fr");
        let bare = DatasetHandle::new("ROA1_").unwrap();
        assert_eq!(bare.suffix(), "ROA1_");
    }

    #[test]
    fn rejects_identifiers_that_could_escape_sql() {
        for bad in ["", "a b", "t;drop", "`x`", "1abc", "ROA1-NL"] {
            assert!(DatasetHandle::new(bad).is_err(), "{bad} should be rejected");
        }
        assert!(DatasetHandle::with_sales_table("ok", "bad name").is_err());
    }
}
