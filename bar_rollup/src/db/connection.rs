//! SQLite connection helpers.
//!
//! Provides [`connect`] that opens a connection and applies the engine's
//! connection-wide PRAGMAs: WAL journaling, foreign_keys=ON, and a 5000ms
//! busy_timeout. Every worker thread opens its own connection; nothing is
//! shared in memory.

use diesel::{Connection, RunQueryDsl, SqliteConnection, sql_query};

use crate::errors::EngineError;

/// Open a SQLite connection and apply connection-wide PRAGMAs.
pub fn connect(database_url: &str) -> Result<SqliteConnection, EngineError> {
    let mut conn = SqliteConnection::establish(database_url)?;

    sql_query("PRAGMA journal_mode=WAL;").execute(&mut conn)?;
    sql_query("PRAGMA foreign_keys=ON;").execute(&mut conn)?;
    sql_query("PRAGMA busy_timeout=5000;").execute(&mut conn)?;
    Ok(conn)
}
