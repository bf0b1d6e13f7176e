// ABOUTME: Table include/exclude filtering for discovery
// ABOUTME: Applies the operator's table selection to the source catalog listing

use anyhow::{bail, Result};

/// Which discovered tables get a mirroring worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    include_tables: Option<Vec<String>>,
    exclude_tables: Option<Vec<String>>,
}

impl TableFilter {
    /// Creates a filter from CLI arguments
    ///
    /// Blank entries are ignored and a list left empty afterwards counts as
    /// not given, so `--include-tables ""` selects everything.
    pub fn new(
        include_tables: Option<Vec<String>>,
        exclude_tables: Option<Vec<String>>,
    ) -> Result<Self> {
        let include_tables = normalize(include_tables);
        let exclude_tables = normalize(exclude_tables);

        // Validate mutually exclusive flags
        if include_tables.is_some() && exclude_tables.is_some() {
            bail!("Cannot use both --include-tables and --exclude-tables");
        }

        Ok(Self {
            include_tables,
            exclude_tables,
        })
    }

    /// Creates an empty filter (mirror everything)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Checks if any filters are active
    pub fn is_empty(&self) -> bool {
        self.include_tables.is_none() && self.exclude_tables.is_none()
    }

    /// Gets the list of tables to include
    pub fn include_tables(&self) -> Option<&Vec<String>> {
        self.include_tables.as_ref()
    }

    /// Gets the list of tables to exclude
    pub fn exclude_tables(&self) -> Option<&Vec<String>> {
        self.exclude_tables.as_ref()
    }

    /// Determines if a table should be mirrored
    pub fn should_mirror_table(&self, table_name: &str) -> bool {
        // If include list exists, table must be in it
        if let Some(ref include) = self.include_tables {
            if !include.iter().any(|t| t == table_name) {
                return false;
            }
        }

        // If exclude list exists, table must not be in it
        if let Some(ref exclude) = self.exclude_tables {
            if exclude.iter().any(|t| t == table_name) {
                return false;
            }
        }

        true
    }

    /// Keep only the tables this filter selects.
    pub fn apply(&self, tables: Vec<String>) -> Vec<String> {
        tables
            .into_iter()
            .filter(|table| self.should_mirror_table(table))
            .collect()
    }
}

fn normalize(tables: Option<Vec<String>>) -> Option<Vec<String>> {
    let tables: Vec<String> = tables?
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if tables.is_empty() {
        None
    } else {
        Some(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_new_validates_mutually_exclusive_table_flags() {
        let result = TableFilter::new(Some(names(&["users"])), Some(names(&["logs"])));
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cannot use both --include-tables and --exclude-tables"
        );
    }

    #[test]
    fn test_should_mirror_table_with_include_list() {
        let filter = TableFilter::new(Some(names(&["users", "orders"])), None).unwrap();
        assert!(filter.should_mirror_table("users"));
        assert!(filter.should_mirror_table("orders"));
        assert!(!filter.should_mirror_table("logs"));
    }

    #[test]
    fn test_should_mirror_table_with_exclude_list() {
        let filter = TableFilter::new(None, Some(names(&["logs"]))).unwrap();
        assert!(filter.should_mirror_table("users"));
        assert!(!filter.should_mirror_table("logs"));
    }

    #[test]
    fn test_empty_filter_mirrors_everything() {
        let filter = TableFilter::empty();
        assert!(filter.is_empty());
        assert_eq!(
            filter.apply(names(&["a", "b", "c"])),
            names(&["a", "b", "c"])
        );
    }

    #[test]
    fn test_blank_entries_are_ignored() {
        let filter = TableFilter::new(Some(names(&["", " "])), Some(names(&["logs"]))).unwrap();
        assert!(filter.include_tables().is_none());
        assert_eq!(filter.exclude_tables(), Some(&names(&["logs"])));
    }

    #[test]
    fn test_entries_are_trimmed() {
        let filter = TableFilter::new(Some(names(&[" users ", "orders"])), None).unwrap();
        assert_eq!(
            filter.apply(names(&["users", "orders", "logs"])),
            names(&["users", "orders"])
        );
    }
}
