// Approval task CRUD. Status transitions are guarded in SQL: a row leaves
// `pending` exactly once, so concurrent resolvers and timers cannot both
// claim the same task.

use super::SessionStore;
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{ApprovalStatus, ApprovalTask, SessionType};
use rusqlite::{params, Row};

fn row_to_task(row: &Row) -> rusqlite::Result<ApprovalTask> {
    let type_str: String = row.get(3)?;
    let status_str: String = row.get(12)?;
    let draft_json: String = row.get(9)?;
    Ok(ApprovalTask {
        id: row.get(0)?,
        session_id: row.get(1)?,
        session_alias: row.get(2)?,
        session_type: SessionType::parse(&type_str).unwrap_or(SessionType::Bunker),
        client: row.get(4)?,
        event_kind: row.get::<_, i64>(5)? as u64,
        event_summary: row.get(6)?,
        policy_id: row.get(7)?,
        policy_label: row.get(8)?,
        draft: serde_json::from_str(&draft_json).unwrap_or(serde_json::Value::Null),
        created_at: row.get(10)?,
        expires_at: row.get(11)?,
        status: ApprovalStatus::parse(&status_str).unwrap_or(ApprovalStatus::Pending),
    })
}

const TASK_COLUMNS: &str = "id, session_id, session_alias, session_type, client, event_kind, \
     event_summary, policy_id, policy_label, draft_json, created_at, expires_at, status";

impl SessionStore {
    pub fn insert_task(&self, task: &ApprovalTask) -> DaemonResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO approval_tasks (id, session_id, session_alias, session_type, client,
                                         event_kind, event_summary, policy_id, policy_label,
                                         draft_json, created_at, expires_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.id,
                task.session_id,
                task.session_alias,
                task.session_type.as_str(),
                task.client,
                task.event_kind as i64,
                task.event_summary,
                task.policy_id,
                task.policy_label,
                serde_json::to_string(&task.draft)?,
                task.created_at,
                task.expires_at,
                task.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> DaemonResult<Option<ApprovalTask>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TASK_COLUMNS} FROM approval_tasks WHERE id = ?1");
        match conn.query_row(&sql, params![id], row_to_task) {
            Ok(task) => Ok(Some(task)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DaemonError::Database(e)),
        }
    }

    pub fn list_pending_tasks(&self) -> DaemonResult<Vec<ApprovalTask>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM approval_tasks WHERE status = 'pending' \
             ORDER BY created_at"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt.query_map([], row_to_task)?.filter_map(|r| r.ok()).collect();
        Ok(tasks)
    }

    pub fn pending_task_ids_for_session(&self, session_id: &str) -> DaemonResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM approval_tasks WHERE session_id = ?1 AND status = 'pending'",
        )?;
        let ids = stmt
            .query_map(params![session_id], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Move a task out of `pending`. Returns false when the task was
    /// missing or already terminal — status is monotonic.
    pub fn finish_task(&self, id: &str, status: ApprovalStatus) -> DaemonResult<bool> {
        if status == ApprovalStatus::Pending {
            return Err(DaemonError::Other("finish_task cannot target pending".into()));
        }
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE approval_tasks SET status = ?1 WHERE id = ?2 AND status = 'pending'",
            params![status.as_str(), id],
        )?;
        Ok(changed > 0)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::now_ms;
    use serde_json::json;

    fn sample_task(id: &str, session_id: &str) -> ApprovalTask {
        ApprovalTask {
            id: id.to_string(),
            session_id: session_id.to_string(),
            session_alias: "laptop".into(),
            session_type: SessionType::Bunker,
            client: "clientpk".into(),
            event_kind: 4,
            event_summary: "kind 4 · hello".into(),
            policy_id: "login_and_publish".into(),
            policy_label: "Login + publish".into(),
            draft: json!({"kind": 4, "content": "hello"}),
            created_at: now_ms(),
            expires_at: now_ms() + 600_000,
            status: ApprovalStatus::Pending,
        }
    }

    #[test]
    fn draft_survives_storage_byte_equal() {
        let store = SessionStore::open_in_memory().unwrap();
        let task = sample_task("t1", "s1");
        store.insert_task(&task).unwrap();

        let pending = store.list_pending_tasks().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            serde_json::to_vec(&pending[0].draft).unwrap(),
            serde_json::to_vec(&task.draft).unwrap()
        );
    }

    #[test]
    fn finish_task_is_monotonic() {
        let store = SessionStore::open_in_memory().unwrap();
        store.insert_task(&sample_task("t1", "s1")).unwrap();

        assert!(store.finish_task("t1", ApprovalStatus::Approved).unwrap());
        // Second transition is refused
        assert!(!store.finish_task("t1", ApprovalStatus::Rejected).unwrap());
        assert_eq!(
            store.get_task("t1").unwrap().unwrap().status,
            ApprovalStatus::Approved
        );
        // Unknown id
        assert!(!store.finish_task("nope", ApprovalStatus::Expired).unwrap());
    }

    #[test]
    fn pending_ids_scoped_to_session() {
        let store = SessionStore::open_in_memory().unwrap();
        store.insert_task(&sample_task("t1", "s1")).unwrap();
        store.insert_task(&sample_task("t2", "s1")).unwrap();
        store.insert_task(&sample_task("t3", "s2")).unwrap();
        store.finish_task("t2", ApprovalStatus::Rejected).unwrap();

        let ids = store.pending_task_ids_for_session("s1").unwrap();
        assert_eq!(ids, vec!["t1".to_string()]);
    }
}
