use crate::core::error;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT_SECS: u64 = 5;

/// Opens a file database with WAL journaling and enforced foreign keys.
pub fn db_connect(db_path: &Path) -> Result<Connection, error::MarketError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(error::MarketError::IoError)?;
        }
    }
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS))
        .map_err(error::MarketError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(error::MarketError::RusqliteError)?;
    conn.execute_batch("PRAGMA synchronous=NORMAL;")
        .map_err(error::MarketError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::MarketError::RusqliteError)?;
    Ok(conn)
}

/// Private in-memory database with the same pragmas minus WAL.
pub fn db_connect_in_memory() -> Result<Connection, error::MarketError> {
    let conn = Connection::open_in_memory()?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(error::MarketError::RusqliteError)?;
    Ok(conn)
}

pub fn market_db_path(root: &Path) -> PathBuf {
    root.join(schemas::MARKET_DB_NAME)
}

pub fn journal_mode(conn: &Connection) -> Result<String, error::MarketError> {
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    Ok(mode.to_lowercase())
}
