// Session row CRUD. The SessionRecord struct is the unit of persistence:
// upsert writes every column, so callers mutate a record and write it back
// rather than issuing field-level updates.

use super::SessionStore;
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{SessionRecord, SessionStatus, SessionType};
use rusqlite::{params, Row};

fn row_to_record(row: &Row) -> rusqlite::Result<SessionRecord> {
    let type_str: String = row.get(1)?;
    let relays_json: String = row.get(4)?;
    let status_str: String = row.get(8)?;
    Ok(SessionRecord {
        id: row.get(0)?,
        session_type: SessionType::parse(&type_str).unwrap_or(SessionType::Bunker),
        key_id: row.get(2)?,
        alias: row.get(3)?,
        relays: serde_json::from_str(&relays_json).unwrap_or_default(),
        secret: row.get(5)?,
        uri: row.get(6)?,
        auto_approve: row.get::<_, i64>(7)? != 0,
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Waiting),
        last_client: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
        active: row.get::<_, i64>(12)? != 0,
        template: row.get(13)?,
    })
}

const SESSION_COLUMNS: &str = "id, type, key_id, alias, relays_json, secret, uri, \
     auto_approve, status, last_client, created_at, updated_at, active, template";

impl SessionStore {
    pub fn upsert_session(&self, record: &SessionRecord) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (id, type, key_id, alias, relays_json, secret, uri,
                                   auto_approve, status, last_client, created_at, updated_at,
                                   active, template)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                 type = ?2, key_id = ?3, alias = ?4, relays_json = ?5, secret = ?6,
                 uri = ?7, auto_approve = ?8, status = ?9, last_client = ?10,
                 created_at = ?11, updated_at = ?12, active = ?13, template = ?14",
            params![
                record.id,
                record.session_type.as_str(),
                record.key_id,
                record.alias,
                serde_json::to_string(&record.relays)?,
                record.secret,
                record.uri,
                record.auto_approve as i64,
                record.status.as_str(),
                record.last_client,
                record.created_at,
                record.updated_at,
                record.active as i64,
                record.template,
            ],
        )?;
        Ok(())
    }

    pub fn list_sessions(&self, active_only: bool) -> DaemonResult<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let sql = if active_only {
            format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE active = 1 ORDER BY created_at")
        } else {
            format!("SELECT {SESSION_COLUMNS} FROM sessions ORDER BY created_at")
        };
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([], row_to_record)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(records)
    }

    pub fn get_session(&self, id: &str) -> DaemonResult<Option<SessionRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
        match conn.query_row(&sql, params![id], row_to_record) {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DaemonError::Database(e)),
        }
    }

    pub fn delete_session(&self, id: &str) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::now_ms;

    fn sample_record(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            session_type: SessionType::Bunker,
            key_id: "k1".into(),
            alias: "laptop".into(),
            relays: vec!["wss://relay.damus.io".into()],
            secret: Some("pairing-secret".into()),
            uri: Some("bunker://pk?relay=wss%3A%2F%2Frelay.damus.io&secret=pairing-secret".into()),
            auto_approve: false,
            status: SessionStatus::Waiting,
            last_client: None,
            created_at: now_ms(),
            updated_at: now_ms(),
            active: true,
            template: "auto_sign".into(),
        }
    }

    #[test]
    fn upsert_list_get_roundtrip() {
        let store = SessionStore::open_in_memory().unwrap();
        let record = sample_record("s1");
        store.upsert_session(&record).unwrap();

        let listed = store.list_sessions(false).unwrap();
        assert_eq!(listed.len(), 1);
        let fetched = store.get_session("s1").unwrap().unwrap();
        assert_eq!(fetched.id, record.id);
        assert_eq!(fetched.relays, record.relays);
        assert_eq!(fetched.secret, record.secret);
        assert_eq!(fetched.template, record.template);
        assert_eq!(fetched.status, record.status);
    }

    #[test]
    fn upsert_overwrites_and_active_filter_applies() {
        let store = SessionStore::open_in_memory().unwrap();
        let mut record = sample_record("s1");
        store.upsert_session(&record).unwrap();

        record.status = SessionStatus::Connected;
        record.last_client = Some("clientpk".into());
        record.active = false;
        store.upsert_session(&record).unwrap();

        assert!(store.list_sessions(true).unwrap().is_empty());
        let fetched = store.get_session("s1").unwrap().unwrap();
        assert_eq!(fetched.status, SessionStatus::Connected);
        assert_eq!(fetched.last_client.as_deref(), Some("clientpk"));
    }

    #[test]
    fn delete_removes_row() {
        let store = SessionStore::open_in_memory().unwrap();
        store.upsert_session(&sample_record("s1")).unwrap();
        store.delete_session("s1").unwrap();
        assert!(store.get_session("s1").unwrap().is_none());
    }
}
