// Intercessio — Relay WebSocket Loop
//
// Connects to a single Nostr relay, subscribes to NIP-46 request envelopes
// addressed to the session's signer key, forwards them to the provider's
// dispatcher, and publishes outbound response events.
//
// One task per configured relay; each loops with escalating backoff until
// the provider raises the stop flag. Responses are fanned out through a
// broadcast channel so every connected relay publishes them.

use crate::atoms::constants::NOSTR_CONNECT_KIND;
use crate::atoms::error::{DaemonError, DaemonResult};
use crate::engine::http::reconnect_delay;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

/// What a relay loop reports back to the provider's dispatcher.
pub(crate) enum RelayInbound {
    /// A raw kind-24133 event addressed to us.
    Event(serde_json::Value),
    Connected(String),
    Disconnected(String),
}

/// The narrow slice of provider state a relay loop needs.
pub(crate) struct RelayContext {
    pub session_id: String,
    /// Hex pubkey the subscription filter listens for (`#p` tag).
    pub signer_pubkey: String,
    pub stop: Arc<AtomicBool>,
    pub inbound: mpsc::UnboundedSender<RelayInbound>,
    pub outbound: broadcast::Sender<String>,
}

/// Outer reconnect loop for one relay. Runs until the stop flag is raised
/// or the inbound channel closes (provider dropped).
pub(crate) async fn relay_task(relay_url: String, ctx: Arc<RelayContext>) {
    let mut outbound_rx = ctx.outbound.subscribe();
    let mut attempt: u32 = 0;
    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }
        match run_relay_once(&relay_url, &ctx, &mut outbound_rx).await {
            Ok(()) => {
                attempt = 0;
            }
            Err(e) => {
                warn!("[nostr] Relay {} error: {}", relay_url, e);
            }
        }
        if ctx.stop.load(Ordering::Relaxed) || ctx.inbound.is_closed() {
            break;
        }
        let delay = reconnect_delay(attempt);
        debug!(
            "[nostr] Relay {} reconnect in {}ms (attempt {})",
            relay_url,
            delay.as_millis(),
            attempt + 1
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn run_relay_once(
    relay_url: &str,
    ctx: &RelayContext,
    outbound_rx: &mut broadcast::Receiver<String>,
) -> DaemonResult<()> {
    let (ws_stream, _) = connect_async(relay_url)
        .await
        .map_err(|e| DaemonError::Provider(format!("WS connect to {relay_url}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    info!("[nostr] Session {} connected to relay {}", ctx.session_id, relay_url);
    let _ = ctx.inbound.send(RelayInbound::Connected(relay_url.to_string()));

    // Subscribe to NIP-46 envelopes addressed to our signer key
    let sub_id = format!("ic-{}", &ctx.signer_pubkey[..8]);
    let req = json!(["REQ", &sub_id, {
        "#p": [ctx.signer_pubkey],
        "kinds": [NOSTR_CONNECT_KIND],
        "since": chrono::Utc::now().timestamp() - 10, // Only new events
    }]);
    if let Err(e) = ws_tx.send(WsMessage::Text(req.to_string())).await {
        let _ = ctx.inbound.send(RelayInbound::Disconnected(relay_url.to_string()));
        return Err(DaemonError::Provider(format!("Subscribe to {relay_url}: {e}")));
    }

    loop {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }

        let msg = tokio::select! {
            msg = ws_rx.next() => msg,
            out = outbound_rx.recv() => {
                match out {
                    Ok(text) => {
                        if let Err(e) = ws_tx.send(WsMessage::Text(text)).await {
                            warn!("[nostr] Failed to publish via {}: {}", relay_url, e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("[nostr] Relay {} lagged, dropped {} outbound events", relay_url, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                continue;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
                // Wake periodically so the stop flag is honored while idle
                continue;
            }
        };

        let text = match msg {
            Some(Ok(WsMessage::Text(t))) => t,
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(WsMessage::Close(_))) => break,
            Some(Err(e)) => {
                warn!("[nostr] WS error from {}: {}", relay_url, e);
                break;
            }
            None => break,
            _ => continue,
        };

        // Nostr messages are JSON arrays: ["EVENT", sub_id, event], ["EOSE", …], …
        let arr: Vec<serde_json::Value> = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if arr.is_empty() {
            continue;
        }

        match arr[0].as_str().unwrap_or("") {
            "EVENT" => {
                if arr.len() < 3 {
                    continue;
                }
                let event = arr[2].clone();
                if event["kind"].as_u64() != Some(NOSTR_CONNECT_KIND) {
                    continue;
                }
                if ctx.inbound.send(RelayInbound::Event(event)).is_err() {
                    break; // provider gone
                }
            }
            "EOSE" => {
                debug!("[nostr] End of stored events from {}", relay_url);
            }
            "NOTICE" => {
                let notice = arr.get(1).and_then(|v| v.as_str()).unwrap_or("");
                warn!("[nostr] NOTICE from {}: {}", relay_url, notice);
            }
            "OK" => {
                let accepted = arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
                if !accepted {
                    let reason = arr.get(3).and_then(|v| v.as_str()).unwrap_or("");
                    warn!("[nostr] Event rejected by {}: {}", relay_url, reason);
                }
            }
            _ => {}
        }
    }

    let _ = ctx.inbound.send(RelayInbound::Disconnected(relay_url.to_string()));
    info!("[nostr] Session {} disconnected from relay {}", ctx.session_id, relay_url);
    Ok(())
}
