//! Schema migrations, applied on every database open.
//!
//! The `user_version` pragma records which migrations have already run, so
//! each one executes exactly once over the lifetime of a database file.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Schema version this build of the crate expects. Bump alongside each new
/// migration module.
const CURRENT_VERSION: u32 = 1;

/// Bring the connected database up to [`CURRENT_VERSION`], applying any
/// outstanding migrations in order.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    tracing::info!(
        current_version = current,
        target_version = CURRENT_VERSION,
        "checking database migrations"
    );

    if current < 1 {
        tracing::info!("applying migration v001_initial");
        v001_initial::up(conn).map_err(|e| StoreError::Migration(e.to_string()))?;
        conn.pragma_update(None, "user_version", 1)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);

        // A second pass sees the version marker and applies nothing.
        run_migrations(&conn).unwrap();
    }
}
