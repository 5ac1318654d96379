// Intercessio Engine — Session Store
// Durable state lives in SQLite via rusqlite: the `sessions` table and the
// `approval_tasks` table. Every runtime transition commits here before it
// is reported as successful; on restart, these rows are authoritative.
//
// Module layout:
//   schema     — idempotent migrations
//   sessions   — session row CRUD
//   approvals  — approval task CRUD + status transitions

use crate::atoms::error::DaemonResult;
use log::info;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

mod approvals;
mod schema;
mod sessions;

/// Thread-safe database wrapper. SQLite serializes writes; the mutex keeps
/// statement preparation and row mapping on one connection.
pub struct SessionStore {
    pub(crate) conn: Mutex<Connection>,
}

impl SessionStore {
    /// Open (or create) the daemon database and run migrations.
    pub fn open(path: &Path) -> DaemonResult<Self> {
        info!("[store] Opening session store at {:?}", path);
        let conn = Connection::open(path)?;

        // WAL for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.execute_batch("PRAGMA foreign_keys=ON;").ok();

        schema::run_migrations(&conn)?;
        Ok(SessionStore { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> DaemonResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(SessionStore { conn: Mutex::new(conn) })
    }
}
