// Intercessio Engine — Policy Registry
// A compile-time catalog of signing policies. Each policy is a pure
// function of (draft event, peer, session summary) → SIGN | REFER | REJECT.
// No I/O, no suspension, deterministic for equal inputs.
//
// Unknown ids selected explicitly are an error at the call site; unknown
// ids read back from a persisted record silently fall back to the default.

use crate::atoms::constants::{LOGIN_KIND, NOTE_KIND, PROFILE_KIND};
use crate::atoms::types::{PolicyContext, PolicyDecision};

pub struct Policy {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    evaluate: fn(&PolicyContext) -> PolicyDecision,
}

impl Policy {
    pub fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
        (self.evaluate)(ctx)
    }
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy").field("id", &self.id).finish()
    }
}

/// Policy applied when a persisted record references an id that no longer
/// resolves.
pub const DEFAULT_POLICY_ID: &str = "login_auto_review";

static REGISTRY: &[Policy] = &[
    Policy {
        id: "auto_sign",
        label: "Auto sign",
        description: "Sign every request without review.",
        evaluate: |_ctx| PolicyDecision::Sign,
    },
    Policy {
        id: "online_login",
        label: "Logins only",
        description: "Sign client-authentication events; reject everything else.",
        evaluate: |ctx| {
            if ctx.event_kind() == LOGIN_KIND {
                PolicyDecision::Sign
            } else {
                PolicyDecision::Reject
            }
        },
    },
    Policy {
        id: "login_and_publish",
        label: "Login + publish",
        description: "Sign logins and short notes, reject profile updates, review the rest.",
        evaluate: |ctx| match ctx.event_kind() {
            k if k == LOGIN_KIND || k == NOTE_KIND => PolicyDecision::Sign,
            k if k == PROFILE_KIND => PolicyDecision::Reject,
            _ => PolicyDecision::Refer,
        },
    },
    Policy {
        id: "login_auto_review",
        label: "Login auto, others review",
        description: "Sign logins automatically; everything else goes to review.",
        evaluate: |ctx| {
            if ctx.event_kind() == LOGIN_KIND {
                PolicyDecision::Sign
            } else {
                PolicyDecision::Refer
            }
        },
    },
];

pub fn all() -> &'static [Policy] {
    REGISTRY
}

pub fn resolve(id: &str) -> Option<&'static Policy> {
    REGISTRY.iter().find(|p| p.id == id)
}

/// Resolution for ids loaded from persisted records: unknown ids get the
/// default policy instead of an error.
pub fn resolve_or_default(id: &str) -> &'static Policy {
    resolve(id).unwrap_or_else(|| {
        resolve(DEFAULT_POLICY_ID).expect("default policy must exist in registry")
    })
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{SessionSummary, SessionType};
    use serde_json::json;

    fn ctx_for<'a>(event: &'a serde_json::Value, session: &'a SessionSummary) -> PolicyContext<'a> {
        PolicyContext { event, client: "clientpk", session }
    }

    fn summary() -> SessionSummary {
        SessionSummary {
            id: "s1".into(),
            alias: "laptop".into(),
            session_type: SessionType::Bunker,
        }
    }

    #[test]
    fn auto_sign_signs_everything() {
        let session = summary();
        let event = json!({"kind": 4, "content": "dm"});
        assert_eq!(
            resolve("auto_sign").unwrap().evaluate(&ctx_for(&event, &session)),
            PolicyDecision::Sign
        );
    }

    #[test]
    fn online_login_rejects_notes() {
        let session = summary();
        let login = json!({"kind": LOGIN_KIND});
        let note = json!({"kind": 1, "content": "hi"});
        let policy = resolve("online_login").unwrap();
        assert_eq!(policy.evaluate(&ctx_for(&login, &session)), PolicyDecision::Sign);
        assert_eq!(policy.evaluate(&ctx_for(&note, &session)), PolicyDecision::Reject);
    }

    #[test]
    fn login_and_publish_refers_dms() {
        let session = summary();
        let policy = resolve("login_and_publish").unwrap();
        let cases = [
            (json!({"kind": LOGIN_KIND}), PolicyDecision::Sign),
            (json!({"kind": 1}), PolicyDecision::Sign),
            (json!({"kind": 0}), PolicyDecision::Reject),
            (json!({"kind": 4}), PolicyDecision::Refer),
        ];
        for (event, expected) in &cases {
            assert_eq!(policy.evaluate(&ctx_for(event, &session)), *expected);
        }
    }

    #[test]
    fn missing_kind_fails_closed() {
        let session = summary();
        let event = json!({"content": "no kind"});
        assert_eq!(
            resolve("online_login").unwrap().evaluate(&ctx_for(&event, &session)),
            PolicyDecision::Reject
        );
    }

    #[test]
    fn unknown_id_falls_back_to_default() {
        assert!(resolve("no_such_policy").is_none());
        assert_eq!(resolve_or_default("no_such_policy").id, DEFAULT_POLICY_ID);
        assert_eq!(resolve_or_default("auto_sign").id, "auto_sign");
    }
}
