// Intercessio Engine — Approval Manager
// Durable queue of REFER decisions awaiting a human. Each pending task has
// a row in the store, a one-shot timer, and (while its session runs) an
// in-memory resolver: task_id → oneshot sender. The signing pipeline owns
// the receiver and suspends on it.
//
// Decision semantics: a task resolves to `true` only via an explicit
// approve; expiry and session shutdown both yield `false`. The oneshot
// guarantees at-most-once resolution; the pending → terminal transition is
// guarded in SQL so the timer and a concurrent resolver cannot both win.

use crate::atoms::constants::{APPROVAL_TTL_ENV, DEFAULT_APPROVAL_TTL_SECS};
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::atoms::types::{now_ms, ApprovalStatus, ApprovalTask, SessionSummary};
use crate::engine::notify::Notifier;
use crate::engine::policy::Policy;
use crate::engine::store::SessionStore;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct PendingWaiter {
    /// Present while the owning session is running. Orphan timers restored
    /// on boot have no sender — nothing is suspended on them.
    sender: Option<oneshot::Sender<bool>>,
    timer: JoinHandle<()>,
}

type WaiterMap = Arc<Mutex<HashMap<String, PendingWaiter>>>;

pub struct ApprovalManager {
    store: Arc<SessionStore>,
    notifier: Arc<Notifier>,
    waiters: WaiterMap,
    ttl: Duration,
}

impl ApprovalManager {
    pub fn new(store: Arc<SessionStore>, notifier: Arc<Notifier>) -> Self {
        let ttl_secs = std::env::var(APPROVAL_TTL_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&secs| secs > 0)
            .unwrap_or(DEFAULT_APPROVAL_TTL_SECS);
        Self::with_ttl(store, notifier, Duration::from_secs(ttl_secs))
    }

    pub fn with_ttl(store: Arc<SessionStore>, notifier: Arc<Notifier>, ttl: Duration) -> Self {
        ApprovalManager {
            store,
            notifier,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Persist a pending task, arm its expiry timer, register the resolver,
    /// and fire a best-effort notification. Returns the task id and the
    /// receiver the signing pipeline awaits.
    pub fn create(
        &self,
        session: &SessionSummary,
        client: &str,
        draft: serde_json::Value,
        policy: &'static Policy,
    ) -> DaemonResult<(String, oneshot::Receiver<bool>)> {
        let created_at = now_ms();
        let task = ApprovalTask {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            session_alias: session.alias.clone(),
            session_type: session.session_type,
            client: client.to_string(),
            event_kind: draft.get("kind").and_then(|k| k.as_u64()).unwrap_or(0),
            event_summary: summarize_draft(&draft),
            policy_id: policy.id.to_string(),
            policy_label: policy.label.to_string(),
            draft,
            created_at,
            expires_at: created_at + self.ttl.as_millis() as i64,
            status: ApprovalStatus::Pending,
        };
        self.store.insert_task(&task)?;

        let (tx, rx) = oneshot::channel();
        let timer = self.spawn_expiry_timer(task.id.clone(), task.expires_at);
        self.waiters
            .lock()
            .insert(task.id.clone(), PendingWaiter { sender: Some(tx), timer });

        info!(
            "[approval] Task {} pending for session {} (kind {}, policy {})",
            task.id, task.session_id, task.event_kind, task.policy_id
        );

        let notifier = Arc::clone(&self.notifier);
        let notify_task = task.clone();
        tokio::spawn(async move {
            notifier.notify_approval(&notify_task).await;
        });

        Ok((task.id, rx))
    }

    /// Resolve a pending task with an explicit decision. `NotFound` when
    /// the task is missing or already terminal.
    pub fn resolve(&self, task_id: &str, approved: bool) -> DaemonResult<()> {
        let status = if approved { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
        if !self.store.finish_task(task_id, status)? {
            return Err(DaemonError::not_found("Approval not found"));
        }
        wake(&self.waiters, task_id, approved);
        info!("[approval] Task {task_id} resolved: {}", status.as_str());
        Ok(())
    }

    /// Reject every pending task belonging to a session. Invoked on session
    /// stop and delete.
    pub fn reject_for_session(&self, session_id: &str) -> DaemonResult<()> {
        for task_id in self.store.pending_task_ids_for_session(session_id)? {
            if self.store.finish_task(&task_id, ApprovalStatus::Rejected)? {
                wake(&self.waiters, &task_id, false);
                info!("[approval] Task {task_id} rejected (session {session_id} stopped)");
            }
        }
        Ok(())
    }

    /// Reconcile pending rows after a restart: rows already past their
    /// expiry flip to `expired` immediately; the rest get an orphan timer
    /// honoring the original deadline. Old waiters are not revived — a
    /// resumed provider re-issues requests through the normal path.
    pub fn restore_timers_on_boot(&self) -> DaemonResult<()> {
        let now = now_ms();
        for task in self.store.list_pending_tasks()? {
            if task.expires_at <= now {
                self.store.finish_task(&task.id, ApprovalStatus::Expired)?;
                info!("[approval] Task {} expired during downtime", task.id);
            } else {
                let timer = self.spawn_expiry_timer(task.id.clone(), task.expires_at);
                self.waiters
                    .lock()
                    .insert(task.id.clone(), PendingWaiter { sender: None, timer });
            }
        }
        Ok(())
    }

    pub fn list_pending(&self) -> DaemonResult<Vec<ApprovalTask>> {
        self.store.list_pending_tasks()
    }

    pub fn get(&self, task_id: &str) -> DaemonResult<Option<ApprovalTask>> {
        self.store.get_task(task_id)
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn spawn_expiry_timer(&self, task_id: String, expires_at: i64) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let waiters = Arc::clone(&self.waiters);
        tokio::spawn(async move {
            let wait_ms = (expires_at - now_ms()).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            match store.finish_task(&task_id, ApprovalStatus::Expired) {
                Ok(true) => {
                    wake(&waiters, &task_id, false);
                    info!("[approval] Task {task_id} expired");
                }
                Ok(false) => {} // already resolved
                Err(e) => warn!("[approval] Failed to expire task {task_id}: {e}"),
            }
        })
    }
}

/// Remove the waiter, cancel its timer, and deliver the decision.
/// Safe to call from the timer itself — aborting a finished task is a no-op.
fn wake(waiters: &WaiterMap, task_id: &str, approved: bool) {
    if let Some(waiter) = waiters.lock().remove(task_id) {
        waiter.timer.abort();
        if let Some(sender) = waiter.sender {
            let _ = sender.send(approved);
        }
    }
}

/// Short human description of a draft: kind plus a content preview.
/// Shared with the signing pipeline's sign-request activity entries.
pub(crate) fn summarize_draft(draft: &serde_json::Value) -> String {
    let kind = draft.get("kind").and_then(|k| k.as_u64()).unwrap_or(0);
    let content = draft.get("content").and_then(|c| c.as_str()).unwrap_or("");
    if content.is_empty() {
        format!("kind {kind}")
    } else {
        let preview: String = content.chars().take(48).collect();
        if preview.chars().count() < content.chars().count() {
            format!("kind {kind} · {preview}…")
        } else {
            format!("kind {kind} · {preview}")
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::SessionType;
    use serde_json::json;

    fn make_manager(ttl: Duration) -> ApprovalManager {
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        ApprovalManager::with_ttl(store, Arc::new(Notifier::new()), ttl)
    }

    fn summary() -> SessionSummary {
        SessionSummary {
            id: "s1".into(),
            alias: "laptop".into(),
            session_type: SessionType::Bunker,
        }
    }

    fn refer_policy() -> &'static Policy {
        crate::engine::policy::resolve("login_and_publish").unwrap()
    }

    #[tokio::test]
    async fn explicit_approve_resolves_true_once() {
        let manager = make_manager(Duration::from_secs(600));
        let (task_id, rx) = manager
            .create(&summary(), "clientpk", json!({"kind": 4, "content": "dm"}), refer_policy())
            .unwrap();

        manager.resolve(&task_id, true).unwrap();
        assert!(rx.await.unwrap());
        assert_eq!(
            manager.get(&task_id).unwrap().unwrap().status,
            ApprovalStatus::Approved
        );

        // Second resolution attempt is NotFound
        assert!(matches!(manager.resolve(&task_id, false), Err(DaemonError::NotFound(_))));
    }

    #[tokio::test]
    async fn expiry_resolves_false() {
        let manager = make_manager(Duration::from_millis(50));
        let (task_id, rx) =
            manager.create(&summary(), "clientpk", json!({"kind": 4}), refer_policy()).unwrap();

        assert!(!rx.await.unwrap());
        assert_eq!(
            manager.get(&task_id).unwrap().unwrap().status,
            ApprovalStatus::Expired
        );
        // Expired tasks can no longer be approved
        assert!(manager.resolve(&task_id, true).is_err());
    }

    #[tokio::test]
    async fn session_stop_rejects_all_pending() {
        let manager = make_manager(Duration::from_secs(600));
        let (id1, rx1) =
            manager.create(&summary(), "clientpk", json!({"kind": 4}), refer_policy()).unwrap();
        let (id2, rx2) =
            manager.create(&summary(), "clientpk", json!({"kind": 7}), refer_policy()).unwrap();

        manager.reject_for_session("s1").unwrap();
        assert!(!rx1.await.unwrap());
        assert!(!rx2.await.unwrap());
        assert_eq!(manager.get(&id1).unwrap().unwrap().status, ApprovalStatus::Rejected);
        assert_eq!(manager.get(&id2).unwrap().unwrap().status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn boot_restore_expires_overdue_rows() {
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let overdue = ApprovalTask {
            id: "t-old".into(),
            session_id: "s1".into(),
            session_alias: "laptop".into(),
            session_type: SessionType::Bunker,
            client: "clientpk".into(),
            event_kind: 4,
            event_summary: "kind 4".into(),
            policy_id: "login_and_publish".into(),
            policy_label: "Login + publish".into(),
            draft: json!({"kind": 4}),
            created_at: now_ms() - 10_000,
            expires_at: now_ms() - 5_000,
            status: ApprovalStatus::Pending,
        };
        store.insert_task(&overdue).unwrap();
        let mut fresh = overdue.clone();
        fresh.id = "t-new".into();
        fresh.expires_at = now_ms() + 60_000;
        store.insert_task(&fresh).unwrap();

        let manager =
            ApprovalManager::with_ttl(store, Arc::new(Notifier::new()), Duration::from_secs(600));
        manager.restore_timers_on_boot().unwrap();

        assert_eq!(manager.get("t-old").unwrap().unwrap().status, ApprovalStatus::Expired);
        assert_eq!(manager.get("t-new").unwrap().unwrap().status, ApprovalStatus::Pending);
        // The still-pending row stays resolvable
        manager.resolve("t-new", false).unwrap();
    }

    #[test]
    fn draft_summaries_truncate() {
        assert_eq!(summarize_draft(&json!({"kind": 4})), "kind 4");
        let long = "x".repeat(80);
        let summary = summarize_draft(&json!({"kind": 1, "content": long}));
        assert!(summary.starts_with("kind 1 · "));
        assert!(summary.ends_with('…'));
    }
}
