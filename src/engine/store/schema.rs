// Database schema and migrations for the Intercessio store.
// Called once at startup by SessionStore::open() after WAL is enabled.
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN (errors are silently swallowed) at the
// end of run_migrations() — never modify existing SQL to keep upgrade paths
// clean. No destructive migrations.

use crate::atoms::error::DaemonResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> DaemonResult<()> {
    // ── Core tables ──────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            key_id TEXT NOT NULL,
            alias TEXT NOT NULL DEFAULT '',
            relays_json TEXT NOT NULL DEFAULT '[]',
            secret TEXT,
            uri TEXT,
            auto_approve INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'waiting',
            last_client TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            template TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS approval_tasks (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            session_alias TEXT NOT NULL DEFAULT '',
            session_type TEXT NOT NULL,
            client TEXT NOT NULL,
            event_kind INTEGER NOT NULL DEFAULT 0,
            event_summary TEXT NOT NULL DEFAULT '',
            policy_id TEXT NOT NULL DEFAULT '',
            policy_label TEXT NOT NULL DEFAULT '',
            draft_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE INDEX IF NOT EXISTS idx_approval_tasks_session
            ON approval_tasks(session_id, status);

        CREATE INDEX IF NOT EXISTS idx_approval_tasks_status
            ON approval_tasks(status, expires_at);
        ",
    )?;

    // ── Additive column migrations ───────────────────────────────────
    // Columns introduced after the first release. ALTER TABLE fails when
    // the column already exists; that error is expected and swallowed.
    conn.execute_batch("ALTER TABLE sessions ADD COLUMN template TEXT NOT NULL DEFAULT '';")
        .ok();

    Ok(())
}
