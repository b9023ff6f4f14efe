//! MQTT over `wss://` using `rumqttc`.
//!
//! The signed URL is handed to rumqttc verbatim as the broker address; the
//! WebSocket handshake carries the SigV4 query string and the `mqtt`
//! subprotocol. rumqttc's event loop only makes progress while polled, so
//! [`MqttConnection::next_event`] is what drives the socket.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tracing::debug;

use super::{Connection, Transport, TransportError, TransportEvent};
use crate::sigv4::SignedUrl;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Upper bound on flushing DISCONNECT during [`Connection::close`].
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MqttTransport {
    keep_alive: Duration,
}

impl MqttTransport {
    pub fn new(keep_alive: Duration) -> Self {
        Self { keep_alive }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn open(
        &self,
        url: &SignedUrl,
        client_id: &str,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let mut options = MqttOptions::new(client_id, url.as_str(), 443);
        options.set_transport(rumqttc::Transport::wss_with_default_config());
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        Ok(Box::new(MqttConnection::new(options)))
    }
}

pub struct MqttConnection {
    client: AsyncClient,
    eventloop: EventLoop,
    /// Set once the event loop reported an error. rumqttc re-dials on the
    /// next poll after an error, so a failed connection is never polled again.
    failed: bool,
}

impl MqttConnection {
    pub fn new(options: MqttOptions) -> Self {
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Self {
            client,
            eventloop,
            failed: false,
        }
    }
}

#[async_trait]
impl Connection for MqttConnection {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Some(TransportEvent::Connected),
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Some(TransportEvent::Message {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("MQTT: suback pkid={} codes={:?}", ack.pkid, ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.failed = true;
                    return Some(TransportEvent::Error("broker sent DISCONNECT".to_string()));
                }
                Ok(_) => {}
                Err(e) => {
                    self.failed = true;
                    return Some(TransportEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        if self.failed {
            debug!("MQTT: connection already failed, skipping disconnect flush");
            return;
        }
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, flush).await.is_err() {
            debug!("MQTT: disconnect flush timed out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::net::TcpListener;

    /// Broker stand-in that accepts TCP connections and drops them at once.
    async fn dropping_listener() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepts);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });
        (port, accepts)
    }

    #[tokio::test]
    async fn close_after_error_does_not_redial() {
        let (port, accepts) = dropping_listener().await;
        let mut options = MqttOptions::new("test-client", "127.0.0.1", port);
        options.set_keep_alive(Duration::from_secs(30));
        let mut conn = MqttConnection::new(options);

        match conn.next_event().await {
            Some(TransportEvent::Error(_)) => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        tokio::time::timeout(Duration::from_millis(100), conn.close())
            .await
            .expect("close should not wait on the network");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 1);
    }
}
