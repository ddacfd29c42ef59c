//! Repository functions, one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! Rows are decoded into private `*Row` structs and converted into the
//! records in [`crate::models`] at this boundary.

pub mod executions;
pub mod node_executions;
pub mod wait_states;
pub mod workflows;

use std::str::FromStr;

use crate::DbError;

/// Parse a text status column, reporting corrupt values as `DbError::Decode`.
pub(crate) fn parse_column<T>(raw: &str) -> Result<T, DbError>
where
    T: FromStr<Err = String>,
{
    raw.parse().map_err(DbError::Decode)
}
