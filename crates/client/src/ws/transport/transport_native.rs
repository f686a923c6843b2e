//! Native/Desktop WebSocket implementation using tokio-tungstenite.
//!
//! Both the socket task and the backoff timer are spawned with
//! `tokio::task::spawn_local`, so the manager must live inside a
//! `tokio::task::LocalSet`.

use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{Timer, TimerHandle, Transport, TransportConnection, TransportLink};
use crate::error::TransportError;

/// Transport backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

impl Transport for TungsteniteTransport {
    fn connect(
        &self,
        url: &Url,
        link: TransportLink,
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        let (sender, receiver) = unbounded();
        tokio::task::spawn_local(run_socket(url.to_string(), link, receiver));
        Ok(Box::new(NativeConnection { sender }))
    }
}

/// Handle to the socket task. Frames go through an unbounded queue so `send`
/// never waits on the network.
struct NativeConnection {
    sender: UnboundedSender<String>,
}

impl TransportConnection for NativeConnection {
    fn send(&self, frame: String) -> Result<(), TransportError> {
        self.sender
            .unbounded_send(frame)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn close(&self) {
        self.sender.close_channel();
    }
}

/// Drive one socket from connect to close. The queue closing (handle closed
/// or dropped) is the signal to send a close frame and stop.
async fn run_socket(url: String, link: TransportLink, mut outbound: UnboundedReceiver<String>) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            link.closed(Some(format!("connect to {} failed: {}", url, e)));
            return;
        }
    };

    link.opened();

    let (mut write, mut read) = ws_stream.split();

    let reason = loop {
        tokio::select! {
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => link.frame(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    break Some(match frame {
                        Some(frame) => format!(
                            "closed by server ({}): {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        ),
                        None => "closed by server".to_string(),
                    });
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(format!("read error: {}", e)),
                None => break Some("stream ended".to_string()),
            },
            frame = outbound.next() => match frame {
                Some(frame) => {
                    if let Err(e) = write.send(Message::text(frame)).await {
                        break Some(format!("write error: {}", e));
                    }
                }
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    break None;
                }
            },
        }
    };

    link.closed(reason);
}

/// Timer backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle {
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        TimerHandle::new(move || handle.abort())
    }
}
