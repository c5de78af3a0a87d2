//! Messages from the host application.
//!
//! Both directions are JSON objects tagged with `type`:
//!
//! ```json
//! {"type":"get_tunnel_status"}
//! {"type":"reconnect_tunnel","next_relays":{"kind":"random"}}
//! {"type":"send_api_request","id":"42","request":{"path":"/v1/accounts"}}
//! ```

use crate::actor::PacketTunnelActor;
use crate::command::ReconnectReason;
use crate::state::ObservedState;
use async_trait::async_trait;
use fos_tunnel_types::NextRelays;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelProviderMessage {
    GetTunnelStatus,
    ReconnectTunnel {
        #[serde(default)]
        next_relays: NextRelays,
    },
    /// The device key was rotated; reconnect with the new one
    PrivateKeyRotation,
    SendApiRequest {
        id: String,
        request: Value,
    },
    CancelApiRequest {
        id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelProviderReply {
    TunnelStatus { status: ObservedState },
    Ack,
    ApiResponse { id: String, response: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum AppMessageError {
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No API proxy configured")]
    ApiProxyUnavailable,

    #[error("API request {id} failed: {reason}")]
    ApiRequest { id: String, reason: String },
}

/// Forwards API requests from the host, untouched, through the tunnel.
#[async_trait]
pub trait ApiRequestProxy: Send + Sync {
    async fn send_request(&self, id: &str, request: Value) -> Result<Value, AppMessageError>;

    fn cancel_request(&self, id: &str);
}

pub struct AppMessageHandler {
    actor: Arc<PacketTunnelActor>,
    api_proxy: Option<Arc<dyn ApiRequestProxy>>,
}

impl AppMessageHandler {
    pub fn new(actor: Arc<PacketTunnelActor>, api_proxy: Option<Arc<dyn ApiRequestProxy>>) -> Self {
        Self { actor, api_proxy }
    }

    pub async fn handle(
        &self,
        message: TunnelProviderMessage,
    ) -> Result<TunnelProviderReply, AppMessageError> {
        match message {
            TunnelProviderMessage::GetTunnelStatus => Ok(TunnelProviderReply::TunnelStatus {
                status: self.actor.observed_state(),
            }),
            TunnelProviderMessage::ReconnectTunnel { next_relays } => {
                self.actor
                    .reconnect(next_relays, ReconnectReason::UserInitiated);
                Ok(TunnelProviderReply::Ack)
            }
            TunnelProviderMessage::PrivateKeyRotation => {
                self.actor.switch_key();
                Ok(TunnelProviderReply::Ack)
            }
            TunnelProviderMessage::SendApiRequest { id, request } => {
                let proxy = self
                    .api_proxy
                    .as_ref()
                    .ok_or(AppMessageError::ApiProxyUnavailable)?;
                debug!("Proxying API request {}", id);
                let response = proxy.send_request(&id, request).await?;
                Ok(TunnelProviderReply::ApiResponse { id, response })
            }
            TunnelProviderMessage::CancelApiRequest { id } => {
                if let Some(proxy) = &self.api_proxy {
                    debug!("Cancelling API request {}", id);
                    proxy.cancel_request(&id);
                }
                Ok(TunnelProviderReply::Ack)
            }
        }
    }

    /// Decode, handle and encode one message.
    pub async fn handle_json(&self, data: &[u8]) -> Result<Vec<u8>, AppMessageError> {
        let message: TunnelProviderMessage = serde_json::from_slice(data)?;
        let reply = self.handle(message).await?;
        Ok(serde_json::to_vec(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::Harness;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct EchoProxy {
        cancelled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ApiRequestProxy for EchoProxy {
        async fn send_request(&self, _id: &str, request: Value) -> Result<Value, AppMessageError> {
            Ok(serde_json::json!({ "echo": request }))
        }

        fn cancel_request(&self, id: &str) {
            self.cancelled.lock().push(id.to_string());
        }
    }

    #[tokio::test]
    async fn test_get_tunnel_status_json() {
        let harness = Harness::new();
        let handler = AppMessageHandler::new(Arc::new(harness.actor()), None);

        let reply = handler
            .handle_json(br#"{"type":"get_tunnel_status"}"#)
            .await
            .unwrap();
        let reply: Value = serde_json::from_slice(&reply).unwrap();

        assert_eq!(reply["type"], "tunnel_status");
        assert_eq!(reply["status"]["state"], "initial");
    }

    #[tokio::test]
    async fn test_reconnect_message_defaults_to_random() {
        let message: TunnelProviderMessage =
            serde_json::from_str(r#"{"type":"reconnect_tunnel"}"#).unwrap();
        assert_eq!(
            message,
            TunnelProviderMessage::ReconnectTunnel {
                next_relays: NextRelays::Random
            }
        );

        let harness = Harness::new();
        let handler = AppMessageHandler::new(Arc::new(harness.actor()), None);
        assert_eq!(handler.handle(message).await.unwrap(), TunnelProviderReply::Ack);
    }

    #[tokio::test]
    async fn test_api_requests_go_through_proxy() {
        let harness = Harness::new();
        let proxy = Arc::new(EchoProxy::default());
        let handler = AppMessageHandler::new(Arc::new(harness.actor()), Some(proxy.clone()));

        let reply = handler
            .handle(TunnelProviderMessage::SendApiRequest {
                id: "7".to_string(),
                request: serde_json::json!({ "path": "/v1/relays" }),
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            TunnelProviderReply::ApiResponse {
                id: "7".to_string(),
                response: serde_json::json!({ "echo": { "path": "/v1/relays" } }),
            }
        );

        handler
            .handle(TunnelProviderMessage::CancelApiRequest { id: "8".to_string() })
            .await
            .unwrap();
        assert_eq!(*proxy.cancelled.lock(), vec!["8".to_string()]);
    }

    #[tokio::test]
    async fn test_api_request_without_proxy_fails() {
        let harness = Harness::new();
        let handler = AppMessageHandler::new(Arc::new(harness.actor()), None);

        let result = handler
            .handle(TunnelProviderMessage::SendApiRequest {
                id: "1".to_string(),
                request: Value::Null,
            })
            .await;
        assert!(matches!(result, Err(AppMessageError::ApiProxyUnavailable)));

        let result = handler.handle_json(b"not json").await;
        assert!(matches!(result, Err(AppMessageError::Json(_))));
    }
}
