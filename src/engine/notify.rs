// Intercessio Engine — Approval Notifier
// Fire-and-forget publisher to an ntfy topic. One POST per approval task:
// body is the human summary, headers carry title/tags and the review link.
// Every failure is logged at WARN and swallowed — the approval flow never
// depends on delivery. No configured topic → publication is a no-op.

use crate::atoms::constants::{
    NTFY_BASE_URL_ENV, NTFY_DEFAULT_BASE_URL, NTFY_TOPIC_ENV, NTFY_TOPIC_FALLBACK_ENV,
    REVIEW_LINK_ENV,
};
use crate::atoms::types::{short_pubkey, ApprovalTask};
use crate::engine::http::shared_client;
use log::{debug, warn};

#[derive(Default)]
pub struct Notifier;

impl Notifier {
    pub fn new() -> Self {
        Notifier
    }

    /// Publish a best-effort notification for a freshly created task.
    pub async fn notify_approval(&self, task: &ApprovalTask) {
        let Some(topic) = configured_topic() else {
            debug!("[ntfy] No topic configured — skipping notification");
            return;
        };
        let base = std::env::var(NTFY_BASE_URL_ENV)
            .unwrap_or_else(|_| NTFY_DEFAULT_BASE_URL.to_string());
        let url = format!("{}/{}", base.trim_end_matches('/'), topic);

        let session_label = if task.session_alias.is_empty() {
            task.session_id.clone()
        } else {
            task.session_alias.clone()
        };
        let body = format!(
            "{} wants a kind {} signature on \"{}\" ({})",
            short_pubkey(&task.client),
            task.event_kind,
            session_label,
            task.policy_label,
        );

        let mut request = shared_client()
            .post(&url)
            .header("X-Title", "Signature approval needed")
            .header("X-Tags", "key,warning")
            .body(body);
        if let Ok(link_base) = std::env::var(REVIEW_LINK_ENV) {
            let review = format!("{}/approvals/{}", link_base.trim_end_matches('/'), task.id);
            request = request.header("X-Click", review);
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!("[ntfy] Notified approval {}", task.id);
            }
            Ok(response) => {
                warn!("[ntfy] Notification for {} got HTTP {}", task.id, response.status());
            }
            Err(e) => {
                warn!("[ntfy] Notification for {} failed: {}", task.id, e);
            }
        }
    }
}

fn configured_topic() -> Option<String> {
    std::env::var(NTFY_TOPIC_ENV)
        .or_else(|_| std::env::var(NTFY_TOPIC_FALLBACK_ENV))
        .ok()
        .filter(|topic| !topic.is_empty())
}
