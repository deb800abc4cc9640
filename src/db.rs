//! SQLite database connection management.
//!
//! Provides a connection pool to the portal database with WAL mode enabled.
//! The database file and its parent directories are created automatically
//! if they don't exist, so `themes init` works on a fresh checkout.
//!
//! # Connection Pool
//!
//! Uses `sqlx::SqlitePool` with up to `[db].max_connections` connections
//! (default 5). Foreign keys are enforced on every connection.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::config::Config;

/// Create a connection pool to the configured database.
///
/// # Errors
///
/// Returns an error if `[db].url` is missing, malformed, or the database
/// cannot be created or connected to.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let url = config.db_url()?;
    let max_connections = config.db.as_ref().map(|db| db.max_connections).unwrap_or(5);

    if let Some(parent) = sqlite_file(url).and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database url: {}", url))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;

    Ok(pool)
}

/// File path behind a `sqlite:` url, if it names one.
fn sqlite_file(url: &str) -> Option<&Path> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next().unwrap_or(rest);
    if path.is_empty() || path == ":memory:" {
        return None;
    }
    Some(Path::new(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_file_from_url() {
        assert_eq!(
            sqlite_file("sqlite://data/portal.sqlite"),
            Some(Path::new("data/portal.sqlite"))
        );
        assert_eq!(
            sqlite_file("sqlite:/tmp/x.db?mode=rwc"),
            Some(Path::new("/tmp/x.db"))
        );
        assert_eq!(sqlite_file("sqlite::memory:"), None);
        assert_eq!(sqlite_file("postgres://host/db"), None);
    }
}
