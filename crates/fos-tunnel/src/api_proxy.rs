//! HTTP API Proxy
//!
//! Executes API requests handed over by the host application. Requests are
//! JSON objects:
//!
//! ```json
//! {"method": "POST", "path": "/accounts/v1/devices", "body": {"pubkey": "..."}}
//! ```
//!
//! and resolve to `{"status": 200, "body": ...}`. One connection per request
//! over hyper's HTTP/1 client, with rustls for `https` base URLs.

use async_trait::async_trait;
use fos_tunnel_core::{ApiRequestProxy, AppMessageError};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::ClientConfig;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::{Position, Url};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
struct ApiRequest {
    #[serde(default = "default_method")]
    method: String,
    path: String,
    #[serde(default)]
    body: Option<Value>,
}

async fn send_over<T>(io: T, request: Request<Full<Bytes>>) -> Result<Response<Incoming>, String>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| e.to_string())?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("API connection error: {}", e);
        }
    });
    sender.send_request(request).await.map_err(|e| e.to_string())
}

async fn execute(base_url: Url, request: ApiRequest) -> Result<Value, String> {
    let url = base_url.join(&request.path).map_err(|e| e.to_string())?;
    let host = url
        .host_str()
        .ok_or_else(|| format!("no host in {}", url))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| format!("no port for {}", url))?;
    let method: Method = request.method.parse().map_err(|_| {
        format!("invalid method {}", request.method)
    })?;

    let body = match &request.body {
        Some(body) => serde_json::to_vec(body).map_err(|e| e.to_string())?,
        None => Vec::new(),
    };
    let http_request = Request::builder()
        .method(method.clone())
        .uri(&url[Position::BeforePath..])
        .header(HOST, host.as_str())
        .header(USER_AGENT, concat!("fos-tunnel/", env!("CARGO_PKG_VERSION")))
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| e.to_string())?;

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .map_err(|e| e.to_string())?;

    let response = if url.scheme() == "https" {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| format!("invalid server name {}", host))?;
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| e.to_string())?;
        send_over(tls_stream, http_request).await?
    } else {
        send_over(stream, http_request).await?
    };

    let status = response.status().as_u16();
    let bytes = response
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?
        .to_bytes();
    debug!("API {} {} -> {} ({} bytes)", method, url, status, bytes.len());

    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    Ok(json!({ "status": status, "body": body }))
}

pub struct HttpApiProxy {
    base_url: Url,
    in_flight: Mutex<HashMap<String, AbortHandle>>,
}

impl HttpApiProxy {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            in_flight: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ApiRequestProxy for HttpApiProxy {
    async fn send_request(&self, id: &str, request: Value) -> Result<Value, AppMessageError> {
        let failed = |reason: String| AppMessageError::ApiRequest {
            id: id.to_string(),
            reason,
        };
        let request: ApiRequest = serde_json::from_value(request)?;

        let base_url = self.base_url.clone();
        let task = tokio::spawn(async move {
            tokio::time::timeout(REQUEST_TIMEOUT, execute(base_url, request))
                .await
                .unwrap_or_else(|_| Err("timed out".to_string()))
        });
        self.in_flight
            .lock()
            .insert(id.to_string(), task.abort_handle());

        let result = task.await;
        self.in_flight.lock().remove(id);
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(reason)) => Err(failed(reason)),
            Err(e) if e.is_cancelled() => Err(failed("cancelled".to_string())),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    fn cancel_request(&self, id: &str) {
        if let Some(handle) = self.in_flight.lock().remove(id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one connection, reads the request head and replies with `response`.
    async fn serve_once(response: Option<&'static str>) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            match response {
                Some(response) => stream.write_all(response.as_bytes()).await.unwrap(),
                None => std::future::pending::<()>().await,
            }
        });
        Url::parse(&format!("http://{}/", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let base_url = serve_once(Some(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 11\r\n\r\n{\"ok\":true}",
        ))
        .await;
        let proxy = HttpApiProxy::new(base_url);

        let response = proxy
            .send_request("1", json!({ "path": "/app/v1/relays" }))
            .await
            .unwrap();

        assert_eq!(response, json!({ "status": 200, "body": { "ok": true } }));
        assert!(proxy.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_request() {
        let base_url = serve_once(None).await;
        let proxy = Arc::new(HttpApiProxy::new(base_url));

        let pending = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.send_request("2", json!({ "path": "/" })).await })
        };
        while !proxy.in_flight.lock().contains_key("2") {
            tokio::task::yield_now().await;
        }
        proxy.cancel_request("2");

        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(AppMessageError::ApiRequest { reason, .. }) if reason == "cancelled"
        ));
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let proxy = HttpApiProxy::new(Url::parse("http://127.0.0.1:1/").unwrap());
        let result = proxy.send_request("3", json!({ "method": "GET" })).await;
        assert!(matches!(result, Err(AppMessageError::Json(_))));
    }
}
