//! Host messages as JSON lines on stdin, replies as JSON lines on stdout.

use anyhow::Result;
use fos_tunnel_core::AppMessageHandler;
use serde_json::{Value, json};
use std::fmt::Display;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Error reply for `line`, tagged with the request id when it has one.
fn error_reply(line: &str, error: impl Display) -> Vec<u8> {
    let mut reply = json!({ "type": "error", "message": error.to_string() });
    let id = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|message| message.get("id").cloned());
    if let Some(id) = id {
        reply["id"] = id;
    }
    reply.to_string().into_bytes()
}

/// Serve messages until stdin closes. Each message is handled on its own
/// task so a slow API request does not hold up status queries.
pub async fn serve(handler: Arc<AppMessageHandler>) -> Result<()> {
    let (replies, mut pending) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(mut reply) = pending.recv().await {
            reply.push(b'\n');
            if let Err(e) = stdout.write_all(&reply).await {
                warn!("Failed to write reply: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        debug!("Host message: {}", line);

        let handler = handler.clone();
        let replies = replies.clone();
        tokio::spawn(async move {
            let reply = match handler.handle_json(line.as_bytes()).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Host message failed: {}", e);
                    error_reply(&line, e)
                }
            };
            let _ = replies.send(reply);
        });
    }

    drop(replies);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(reply: Vec<u8>) -> Value {
        serde_json::from_slice(&reply).unwrap()
    }

    #[test]
    fn test_error_reply_carries_request_id() {
        let line = r#"{"type":"send_api_request","id":"req-7","request":{"path":"/"}}"#;
        let reply = parse(error_reply(line, "connection refused"));

        assert_eq!(
            reply,
            json!({ "type": "error", "id": "req-7", "message": "connection refused" })
        );
    }

    #[test]
    fn test_error_reply_without_id() {
        let reply = parse(error_reply("not json", "expected value"));

        assert_eq!(reply, json!({ "type": "error", "message": "expected value" }));
    }
}
