// Websocket transport for the managed realtime service

use super::protocol::PROTOCOL_VSN;
use super::transport::{RealtimeConnection, RealtimeTransport, TransportError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

/// Derive the realtime endpoint from the project base URL
/// (`https://x.example.co` becomes `wss://x.example.co/realtime/v1`).
pub fn realtime_endpoint(base_url: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| TransportError::Connect(format!("invalid base url {}: {}", base_url, e)))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Connect(format!(
                "unsupported url scheme {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::Connect("cannot set websocket scheme".into()))?;
    let path = format!("{}/realtime/v1", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

/// Connects to `{endpoint}/websocket?apikey=..&vsn=1.0.0`.
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    pub fn new(endpoint: &Url, api_key: &str) -> Result<Self, TransportError> {
        let path = format!("{}/websocket", endpoint.path().trim_end_matches('/'));
        let mut url = endpoint.clone();
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", api_key)
            .append_pair("vsn", PROTOCOL_VSN);
        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RealtimeTransport for WebSocketTransport {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>, TransportError> {
        tracing::debug!("Opening realtime websocket to {}", self.url.host_str().unwrap_or("?"));
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message.map_err(|e| TransportError::Io(e.to_string()))? {
                Message::Text(text) => return Ok(Some(text)),
                Message::Binary(bytes) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Message::Close(_) => return Ok(None),
                // Pings are answered by tungstenite on the next write
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("Websocket close: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_base_url() {
        let url = realtime_endpoint("https://abc.supabase.co").unwrap();
        assert_eq!(url.as_str(), "wss://abc.supabase.co/realtime/v1");
        let url = realtime_endpoint("http://localhost:54321/").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:54321/realtime/v1");
        assert!(realtime_endpoint("ftp://nope").is_err());
    }

    #[test]
    fn test_transport_url_carries_key_and_version() {
        let endpoint = realtime_endpoint("https://abc.supabase.co").unwrap();
        let transport = WebSocketTransport::new(&endpoint, "anon-key").unwrap();
        assert_eq!(
            transport.url().as_str(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }
}
