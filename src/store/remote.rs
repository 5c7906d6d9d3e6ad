//! Document gateway reached over HTTP and WebSocket.
//!
//! One-shot queries are `POST {api}/v1/query` with the JSON-encoded [`Query`]
//! as body. Push subscriptions connect to `{ws}/v1/listen`, send
//! `{"action":"listen","query":{...}}`, then receive full result sets:
//!
//! ```text
//!  gateway ──push──▶ listen_loop (background task, auto-reconnect)
//!                       │  {"type":"snapshot","documents":[...]}
//!                       ▼
//!                 Subscription::next()
//! ```
//!
//! The gateway pings with a text `"ping"` frame and expects `"pong"` back.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Delivery, Document, DocumentStore, Query, StoreError, Subscription};

const PING_INTERVAL_SECS: u64 = 25;
const MAX_BACKOFF_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    documents: Vec<Document>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ListenFrame {
    Snapshot {
        #[serde(default)]
        documents: Vec<Document>,
    },
    Error {
        message: String,
    },
}

/// Client for the document gateway.
#[derive(Clone)]
pub struct RemoteStore {
    http: Client,
    query_url: Url,
    listen_url: Url,
    api_key: Option<String>,
}

impl RemoteStore {
    pub fn new(api_url: &str, ws_url: &str, api_key: Option<String>) -> Result<Self, StoreError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let query_url = with_trailing_slash(Url::parse(api_url)?).join("v1/query")?;
        let mut listen_url = with_trailing_slash(Url::parse(ws_url)?).join("v1/listen")?;
        if let Some(key) = &api_key {
            listen_url.query_pairs_mut().append_pair("token", key);
        }
        Ok(RemoteStore {
            http,
            query_url,
            listen_url,
            api_key,
        })
    }
}

/// `Url::join` replaces the last path segment unless the base ends in `/`.
fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

#[async_trait]
impl DocumentStore for RemoteStore {
    fn name(&self) -> &str {
        "RemoteStore"
    }

    async fn get_documents(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        debug!("Querying '{}' via {}", query.collection, self.query_url);

        let mut req = self.http.post(self.query_url.clone()).json(query);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::Status { status, body });
        }

        let body = resp.text().await?;
        let parsed: QueryResponse = serde_json::from_str(&body)?;
        Ok(parsed.documents)
    }

    async fn listen(&self, query: &Query) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(16);
        let url = self.listen_url.clone();
        let subscribe = json!({"action": "listen", "query": query}).to_string();
        let label = query.collection.clone();

        let task = tokio::spawn(async move {
            listen_loop(&label, &url, &subscribe, tx).await;
        });
        Ok(Subscription::new(rx, Some(task)))
    }
}

/// Decode one text frame from the gateway.
fn parse_frame(text: &str) -> Delivery {
    match serde_json::from_str::<ListenFrame>(text)? {
        ListenFrame::Snapshot { documents } => Ok(documents),
        ListenFrame::Error { message } => Err(StoreError::Protocol(message)),
    }
}

/// Persistent listen connection with auto-reconnect and jittered exponential
/// backoff. Returns once the subscriber has gone away.
async fn listen_loop(label: &str, url: &Url, subscribe: &str, tx: mpsc::Sender<Delivery>) {
    let mut backoff_secs = 1u64;

    loop {
        info!("[{}] Connecting to listen stream", label);

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => {
                info!("[{}] Listen stream connected", label);
                backoff_secs = 1;

                let (mut write, mut read) = ws_stream.split();

                if let Err(e) = write.send(Message::Text(subscribe.to_string())).await {
                    error!("[{}] Failed to send listen request: {}", label, e);
                    if tx.send(Err(e.into())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_secs(backoff_secs)).await;
                    continue;
                }

                let mut ping_interval =
                    tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));

                loop {
                    tokio::select! {
                        _ = tx.closed() => {
                            debug!("[{}] Subscriber gone, closing listen stream", label);
                            return;
                        }
                        msg = read.next() => {
                            let delivery = match msg {
                                Some(Ok(Message::Text(text))) => {
                                    if text.trim() == "ping" {
                                        let _ = write.send(Message::Text("pong".to_string())).await;
                                        continue;
                                    }
                                    parse_frame(&text)
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                    continue;
                                }
                                Some(Ok(Message::Close(_))) => {
                                    warn!("[{}] Gateway closed listen stream", label);
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("[{}] Listen stream error: {}", label, e);
                                    break;
                                }
                                None => {
                                    warn!("[{}] Listen stream ended", label);
                                    break;
                                }
                                _ => continue,
                            };
                            if tx.send(delivery).await.is_err() {
                                return;
                            }
                        }
                        _ = ping_interval.tick() => {
                            if let Err(e) = write.send(Message::Ping(vec![])).await {
                                error!("[{}] Ping failed: {}", label, e);
                                break;
                            }
                        }
                    }
                }

                let _ = tx
                    .send(Err(StoreError::Unavailable(format!(
                        "listen stream for '{}' disconnected",
                        label
                    ))))
                    .await;
            }
            Err(e) => {
                error!("[{}] Listen connection failed: {}", label, e);
                if tx.send(Err(e.into())).await.is_err() {
                    return;
                }
            }
        }

        if tx.is_closed() {
            return;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..500);
        warn!("[{}] Reconnecting in {}s...", label, backoff_secs);
        tokio::time::sleep(Duration::from_secs(backoff_secs) + Duration::from_millis(jitter_ms))
            .await;
        backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let store = RemoteStore::new(
            "https://docs.example.com/api",
            "wss://docs.example.com/stream/",
            Some("k3y".into()),
        )
        .unwrap();
        assert_eq!(store.query_url.as_str(), "https://docs.example.com/api/v1/query");
        assert_eq!(
            store.listen_url.as_str(),
            "wss://docs.example.com/stream/v1/listen?token=k3y"
        );
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            RemoteStore::new("not a url", "wss://x", None),
            Err(StoreError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_parse_snapshot_frame() {
        let docs = parse_frame(
            r#"{"type":"snapshot","documents":[{"id":"a","fields":{"gameId":1}}]}"#,
        )
        .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "a");
    }

    #[test]
    fn test_parse_error_and_garbage_frames() {
        assert!(matches!(
            parse_frame(r#"{"type":"error","message":"quota"}"#),
            Err(StoreError::Protocol(m)) if m == "quota"
        ));
        assert!(matches!(parse_frame("{oops"), Err(StoreError::Decode(_))));
    }
}
