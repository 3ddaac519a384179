/// WebSocket session handling
///
/// One task per accepted socket. The handshake reads `agentId` and `clientId`
/// from the query string; the session is then registered with the hub and
/// split into a reader loop (inbound frames to the hub) and a writer task
/// draining the session's outbound queue.
use crate::errors::{DaemonError, DaemonResult};
use agentlink_core::{Hub, Outbound, OUTBOUND_QUEUE_CAPACITY};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Map};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::handshake::server::{ErrorResponse, Request, Response},
    tungstenite::Message as WsMessage,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Agent id used when the client does not supply one.
pub const UNKNOWN_AGENT: &str = "unknown";

/// How long the writer may take to flush after shutdown.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity requested by the client in the connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub agent_id: String,
    pub client_id: String,
}

impl SessionIdentity {
    /// Parse `agentId`/`clientId` from a query string, filling defaults.
    pub fn from_query(query: Option<&str>) -> Self {
        let mut agent_id = None;
        let mut client_id = None;
        if let Some(query) = query {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "agentId" if !value.is_empty() => agent_id = Some(value.into_owned()),
                    "clientId" if !value.is_empty() => client_id = Some(value.into_owned()),
                    _ => {}
                }
            }
        }
        Self {
            agent_id: agent_id.unwrap_or_else(|| UNKNOWN_AGENT.to_string()),
            client_id: client_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }
}

/// Serve one WebSocket connection until it closes or the service stops.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> DaemonResult<()> {
    let mut query: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        query = req.uri().query().map(str::to_string);
        Ok(resp)
    };

    let mut ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return Err(DaemonError::Server(e.to_string()));
        }
    };

    let identity = SessionIdentity::from_query(query.as_deref());
    let SessionIdentity { agent_id, client_id } = identity;

    // the service may have stopped while the handshake was in flight
    if shutdown_signalled(&mut shutdown_rx) {
        debug!(peer = %peer, "Rejecting session opened during shutdown");
        let _ = ws_stream.close(None).await;
        return Ok(());
    }

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let mut metadata = Map::new();
    metadata.insert("peer".to_string(), json!(peer.to_string()));
    let epoch = hub
        .registry()
        .register(&client_id, &agent_id, metadata, outbound_tx);

    // shutdown is signalled before sessions are closed, so a registration
    // racing the close sees the signal here
    if shutdown_signalled(&mut shutdown_rx) {
        hub.registry().remove_session(&client_id, epoch);
        return Ok(());
    }

    let (mut ws_sink, mut ws_source) = ws_stream.split();

    let writer_client = client_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Envelope(envelope) => {
                    let text = match envelope.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(envelope_id = %envelope.id, error = %e, "Failed to encode envelope");
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                        warn!(client_id = %writer_client, error = %e, "Failed to write to socket");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    let registry = hub.registry().clone();
    let mut shutting_down = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                debug!(client_id = %client_id, "Session stopping for shutdown");
                shutting_down = true;
                break;
            }
            _ = &mut writer => {
                debug!(client_id = %client_id, "Writer finished");
                registry.deregister_session(&client_id, epoch);
                break;
            }
            frame = ws_source.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Err(e) = hub.handle_inbound(&client_id, &agent_id, &text).await {
                            debug!(client_id = %client_id, error = %e, "Inbound frame rejected");
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!(client_id = %client_id, agent_id = %agent_id, "Client closed connection");
                        registry.deregister_session(&client_id, epoch);
                        break;
                    }
                    Some(Ok(_)) => {
                        // binary, ping and pong frames carry nothing for the hub
                        registry.record_activity(&client_id);
                    }
                    Some(Err(e)) => {
                        warn!(client_id = %client_id, error = %e, "WebSocket read error");
                        registry.mark_session_error(&client_id, epoch);
                        break;
                    }
                }
            }
        }
    }

    if shutting_down {
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
    } else {
        writer.abort();
    }

    debug!(client_id = %client_id, "Session ended");
    Ok(())
}

fn shutdown_signalled(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_query() {
        let identity = SessionIdentity::from_query(Some("agentId=seo-agent&clientId=c-1"));
        assert_eq!(identity.agent_id, "seo-agent");
        assert_eq!(identity.client_id, "c-1");
    }

    #[test]
    fn test_identity_defaults() {
        let identity = SessionIdentity::from_query(None);
        assert_eq!(identity.agent_id, UNKNOWN_AGENT);
        assert!(Uuid::parse_str(&identity.client_id).is_ok());

        let identity = SessionIdentity::from_query(Some("agentId=&other=1"));
        assert_eq!(identity.agent_id, UNKNOWN_AGENT);
    }

    #[test]
    fn test_shutdown_signalled() {
        let (tx, mut rx) = broadcast::channel(1);
        assert!(!shutdown_signalled(&mut rx));
        tx.send(()).unwrap();
        assert!(shutdown_signalled(&mut rx));

        let mut late = tx.subscribe();
        drop(tx);
        assert!(shutdown_signalled(&mut late));
    }

    #[test]
    fn test_identity_decodes_percent_encoding() {
        let identity = SessionIdentity::from_query(Some("agentId=web%20dev"));
        assert_eq!(identity.agent_id, "web dev");
    }
}
