//! Query operation results.

use crate::error::{Error, Result};

/// Outcome of one query operation.
///
/// `affected` is parsed from the final CommandComplete tag (the last
/// whitespace-separated token; tags without a numeric suffix yield zero).
/// `rows_returned` counts the DataRow messages streamed to the destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryResult {
    affected: u64,
    returned: u64,
}

impl QueryResult {
    pub(crate) fn new(affected: u64, returned: u64) -> Self {
        Self { affected, returned }
    }

    /// Number of rows affected by the command.
    pub fn affected(&self) -> u64 {
        self.affected
    }

    /// Number of rows returned to the destination.
    pub fn rows_returned(&self) -> u64 {
        self.returned
    }
}

/// `exec_one` contract: exactly one affected row.
pub(crate) fn check_one_affected(result: QueryResult) -> Result<QueryResult> {
    match result.affected() {
        0 => Err(Error::NoRows),
        1 => Ok(result),
        _ => Err(Error::MultiRows),
    }
}

/// `query_one` contract: exactly one returned row.
pub(crate) fn check_one_returned(result: QueryResult) -> Result<QueryResult> {
    match result.rows_returned() {
        0 => Err(Error::NoRows),
        1 => Ok(result),
        _ => Err(Error::MultiRows),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_row_contracts() {
        assert!(matches!(
            check_one_affected(QueryResult::new(0, 0)),
            Err(Error::NoRows)
        ));
        assert!(check_one_affected(QueryResult::new(1, 0)).is_ok());
        assert!(matches!(
            check_one_affected(QueryResult::new(2, 0)),
            Err(Error::MultiRows)
        ));

        assert!(matches!(
            check_one_returned(QueryResult::new(1, 0)),
            Err(Error::NoRows)
        ));
        assert!(check_one_returned(QueryResult::new(1, 1)).is_ok());
        assert!(matches!(
            check_one_returned(QueryResult::new(2, 2)),
            Err(Error::MultiRows)
        ));
    }
}
