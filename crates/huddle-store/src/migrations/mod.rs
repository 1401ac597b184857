//! Schema migrations, applied in order when a [`Database`](crate::Database)
//! opens. `PRAGMA user_version` records the last applied step.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Every migration, oldest first. A step's version is its position plus one.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

fn schema_version(conn: &Connection) -> Result<usize> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(usize::try_from(version).unwrap_or(0))
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied = schema_version(conn)?;
    if applied >= STEPS.len() {
        tracing::debug!(version = applied, "schema up to date");
        return Ok(());
    }

    for (index, (name, step)) in STEPS.iter().enumerate().skip(applied) {
        let version = index + 1;
        tracing::info!(migration = *name, version, "applying migration");
        step(conn).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        conn.pragma_update(None, "user_version", version as i64)?;
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
        run_migrations(&conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), STEPS.len());
    }
}
