use std::time::Duration;

use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

/// The delay before reconnecting to the feed after a failure.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// A message announced on the broadcast feed, before it is confirmed on L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedMessage {
    /// The position of the message in the sequencer's message stream.
    pub sequence_number: u64,
    /// The hash of the message.
    pub message_hash: B256,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPayload {
    Batch { messages: Vec<FeedMessage> },
    Single(FeedMessage),
}

/// Parse a feed text frame. A frame carries either a single message or a batch of them.
pub fn parse_feed_frame(text: &str) -> Result<Vec<FeedMessage>, serde_json::Error> {
    Ok(match serde_json::from_str::<FeedPayload>(text)? {
        FeedPayload::Batch { messages } => messages,
        FeedPayload::Single(message) => vec![message],
    })
}

/// A client of the sequencer broadcast feed.
///
/// The client cycles through the configured URLs, reconnecting in the background whenever a
/// connection fails or stays silent for longer than the configured timeout.
#[derive(Debug, Clone)]
pub struct FeedClient {
    urls: Vec<Url>,
    timeout: Duration,
}

impl FeedClient {
    /// Create a new [`FeedClient`].
    pub const fn new(urls: Vec<Url>, timeout: Duration) -> Self {
        Self { urls, timeout }
    }

    /// Connect to the feed and stream its messages to the caller until `cancel` fires or the
    /// stream is dropped.
    pub fn subscribe(&self, cancel: CancellationToken) -> ReceiverStream<FeedMessage> {
        let (tx, rx) = mpsc::channel(1024);
        let urls = self.urls.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            for url in urls.iter().cycle() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    keep_going = stream_from(url, timeout, &tx) => {
                        if !keep_going {
                            break;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }

            debug!("Feed client stopped");
        });

        ReceiverStream::new(rx)
    }
}

/// Stream the messages of a single connection. Returns `false` if the receiver was dropped.
async fn stream_from(url: &Url, timeout: Duration, tx: &mpsc::Sender<FeedMessage>) -> bool {
    let mut ws_stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            error!(%url, "Failed to connect to feed: {}", e);
            return true;
        }
    };

    info!(%url, "📡 Connected to broadcast feed");

    loop {
        let msg = match tokio::time::timeout(timeout, ws_stream.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                debug!(%url, "Feed stream ended");
                return true;
            }
            Err(_) => {
                warn!(%url, ?timeout, "No feed message received in time, reconnecting");
                return true;
            }
        };

        match msg {
            Ok(Message::Text(text)) => match parse_feed_frame(&text) {
                Ok(messages) => {
                    for message in messages {
                        if tx.send(message).await.is_err() {
                            return false;
                        }
                    }
                }
                Err(e) => error!(?e, %text, "Failed to deserialize feed message"),
            },
            Ok(Message::Close(_)) => {
                debug!(%url, "Feed connection closed");
                return true;
            }
            Err(e) => {
                error!(%url, "Feed WebSocket error: {}", e);
                return true;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::SinkExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    #[test]
    fn parses_single_and_batched_frames() {
        let hash = B256::repeat_byte(1);
        let single = format!(r#"{{"sequenceNumber":7,"messageHash":"{hash}"}}"#);
        assert_eq!(
            parse_feed_frame(&single).unwrap(),
            vec![FeedMessage { sequence_number: 7, message_hash: hash }]
        );

        let batch = format!(
            r#"{{"messages":[{{"sequenceNumber":8,"messageHash":"{hash}"}},{{"sequenceNumber":9,"messageHash":"{hash}"}}]}}"#
        );
        let parsed = parse_feed_frame(&batch).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].sequence_number, 9);

        assert!(parse_feed_frame("{}").is_err());
    }

    #[tokio::test]
    async fn streams_messages_from_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let frame = serde_json::to_string(&FeedMessage {
                sequence_number: 3,
                message_hash: B256::repeat_byte(3),
            })
            .unwrap();
            ws.send(Message::Text(frame.into())).await.unwrap();
            // Keep the connection open until the client is done.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let cancel = CancellationToken::new();
        let client = FeedClient::new(
            vec![Url::parse(&format!("ws://{addr}")).unwrap()],
            Duration::from_secs(10),
        );
        let mut stream = client.subscribe(cancel.clone());

        let message = stream.next().await.unwrap();
        assert_eq!(message.sequence_number, 3);
        cancel.cancel();
    }
}
