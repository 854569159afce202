//! Session gateway: one client's WebSocket session in front of the shared device bridge.
//!
//! Transport-independent; the server feeds it text frames and bridge events and writes
//! back whatever it returns.

use crate::bridge::{BridgeEvent, DeviceAddress, DeviceBridge, SubscriberId};
use crate::command::{self, INVALID_COMMAND_MESSAGE};
use crate::gateway::protocol::{ClientMessage, ConnectQuery, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Missing IP or port parameters")]
    MissingAddress,
    #[error("invalid device port: {0}")]
    InvalidPort(String),
}

/// Build the target address from session query parameters. `port` must be 1..=65535.
pub fn device_address(query: &ConnectQuery) -> Result<DeviceAddress, SessionError> {
    let ip = query
        .ip
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SessionError::MissingAddress)?;
    let port = query
        .port
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(SessionError::MissingAddress)?;
    let port_num = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| SessionError::InvalidPort(port.to_string()))?;
    Ok(DeviceAddress::new(ip, port_num))
}

/// Leaves the bridge on [`close`](Self::close), or on drop if the owning task ended
/// without closing.
pub struct SessionGateway {
    id: String,
    bridge: Arc<DeviceBridge>,
    subscriber: SubscriberId,
    left: bool,
}

impl SessionGateway {
    /// Subscribe to the bridge and point it at `address`. Another session's device
    /// connection, if any, is replaced.
    pub async fn open(
        bridge: Arc<DeviceBridge>,
        address: DeviceAddress,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let subscription = bridge.subscribe().await;
        bridge.connect(address).await;
        let session = Self {
            id: uuid::Uuid::new_v4().to_string(),
            bridge,
            subscriber: subscription.id,
            left: false,
        };
        (session, subscription.events)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle one text frame from the client. Returns the reply to send, if any.
    pub async fn handle_text(&self, text: &str) -> Option<ServerMessage> {
        let msg = match ClientMessage::parse(text) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("session {}: unparseable frame: {}", self.id, e);
                return Some(ServerMessage::error(format!("invalid JSON: {}", e)));
            }
        };
        match msg {
            ClientMessage::Ping { timestamp } => Some(ServerMessage::Pong { timestamp }),
            ClientMessage::Other(value) => {
                log::warn!("session {}: ignoring non-command message: {}", self.id, value);
                None
            }
            ClientMessage::Command { cmd, intensity } => {
                let letter = cmd.as_str().unwrap_or_default();
                let command = match command::validate(letter, &intensity) {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!("session {}: rejected command {}: {}", self.id, cmd, e);
                        return Some(ServerMessage::error(INVALID_COMMAND_MESSAGE));
                    }
                };
                match self.bridge.send(command::encode(&command)).await {
                    Ok(()) => {
                        log::debug!("session {}: sent {} to device", self.id, command.kind().letter());
                        None
                    }
                    Err(e) => {
                        log::warn!("session {}: cannot send command: {}", self.id, e);
                        Some(ServerMessage::error(e.to_string()))
                    }
                }
            }
        }
    }

    /// Client frame for a bridge event.
    pub fn event_message(event: BridgeEvent) -> ServerMessage {
        match event {
            BridgeEvent::Status { connected, error } => ServerMessage::Status { connected, error },
            BridgeEvent::Data(bytes) => ServerMessage::DeviceData {
                data: String::from_utf8_lossy(&bytes).into_owned(),
            },
        }
    }

    /// Leave the bridge; the last session out tears the device connection down.
    /// Returns the number of sessions still live.
    pub async fn close(mut self) -> usize {
        let remaining = self.bridge.leave(self.subscriber).await;
        self.left = true;
        remaining
    }
}

impl Drop for SessionGateway {
    fn drop(&mut self) {
        if self.left {
            return;
        }
        let bridge = Arc::clone(&self.bridge);
        let subscriber = self.subscriber;
        let id = std::mem::take(&mut self.id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let remaining = bridge.leave(subscriber).await;
                    log::warn!("session {} ended without closing ({} remaining)", id, remaining);
                });
            }
            Err(_) => log::error!("session {} dropped outside the runtime; bridge not released", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeState;
    use crate::config::DeviceConfig;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn query(ip: Option<&str>, port: Option<&str>) -> ConnectQuery {
        ConnectQuery {
            ip: ip.map(String::from),
            port: port.map(String::from),
        }
    }

    fn quick_bridge() -> Arc<DeviceBridge> {
        DeviceBridge::new(DeviceConfig {
            connect_timeout_ms: 1_000,
            reconnect_delay_ms: 60_000,
            read_buffer_size: 256,
        })
    }

    async fn wait_connected(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .expect("timed out waiting for status")
            .expect("events closed");
        assert!(matches!(event, BridgeEvent::Status { connected: true, .. }));
    }

    #[test]
    fn address_requires_ip_and_port() {
        assert_eq!(
            device_address(&query(Some("10.0.0.5"), Some("5006"))),
            Ok(DeviceAddress::new("10.0.0.5", 5006))
        );
        assert_eq!(
            device_address(&query(None, Some("5006"))),
            Err(SessionError::MissingAddress)
        );
        assert_eq!(
            device_address(&query(Some("10.0.0.5"), None)),
            Err(SessionError::MissingAddress)
        );
        assert_eq!(
            device_address(&query(Some(""), Some("5006"))),
            Err(SessionError::MissingAddress)
        );
    }

    #[test]
    fn address_rejects_bad_ports() {
        for bad in ["0", "65536", "-1", "abc", "50.5"] {
            assert_eq!(
                device_address(&query(Some("10.0.0.5"), Some(bad))),
                Err(SessionError::InvalidPort(bad.to_string()))
            );
        }
    }

    #[test]
    fn data_events_become_device_data_frames() {
        let msg = SessionGateway::event_message(BridgeEvent::Data(b"battery 87%".to_vec()));
        assert_eq!(
            msg,
            ServerMessage::DeviceData {
                data: "battery 87%".to_string()
            }
        );
    }

    #[tokio::test]
    async fn ping_is_answered_without_device() {
        let bridge = quick_bridge();
        let (session, _events) =
            SessionGateway::open(bridge.clone(), DeviceAddress::new("127.0.0.1", 9)).await;
        let reply = session
            .handle_text(r#"{"type":"ping","timestamp":1234.5}"#)
            .await;
        assert_eq!(
            reply,
            Some(ServerMessage::Pong {
                timestamp: Some(json!(1234.5))
            })
        );
        assert_eq!(
            session.handle_text(r#"{"type":"ping"}"#).await,
            Some(ServerMessage::Pong { timestamp: None })
        );
        session.close().await;
    }

    #[tokio::test]
    async fn dropped_session_still_leaves_the_bridge() {
        let bridge = quick_bridge();
        let (session, _events) =
            SessionGateway::open(bridge.clone(), DeviceAddress::new("127.0.0.1", 9)).await;
        assert_eq!(bridge.session_count().await, 1);

        drop(session);
        for _ in 0..100 {
            if bridge.session_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(bridge.session_count().await, 0);
        assert_eq!(bridge.state().await, BridgeState::Disconnected);
        assert_eq!(bridge.address().await, None);
    }

    #[tokio::test]
    async fn valid_command_reaches_device_as_single_letter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bridge = quick_bridge();
        let (session, mut events) =
            SessionGateway::open(bridge.clone(), DeviceAddress::new("127.0.0.1", port)).await;
        let (mut device, _) = listener.accept().await.unwrap();
        wait_connected(&mut events).await;

        assert_eq!(session.handle_text(r#"{"cmd":"F","intensity":80}"#).await, None);
        let mut buf = [0u8; 2];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"F\n");

        assert_eq!(session.close().await, 0);
        assert_eq!(bridge.state().await, BridgeState::Disconnected);
    }

    #[tokio::test]
    async fn invalid_command_is_reported_and_not_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bridge = quick_bridge();
        let (session, mut events) =
            SessionGateway::open(bridge.clone(), DeviceAddress::new("127.0.0.1", port)).await;
        let (mut device, _) = listener.accept().await.unwrap();
        wait_connected(&mut events).await;

        for frame in [
            r#"{"cmd":"X","intensity":50}"#,
            r#"{"cmd":"F","intensity":150}"#,
            r#"{"cmd":"F","intensity":"fast"}"#,
            r#"{"cmd":7,"intensity":50}"#,
        ] {
            assert_eq!(
                session.handle_text(frame).await,
                Some(ServerMessage::error("Invalid command format"))
            );
        }

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(200), device.read(&mut buf)).await;
        assert!(read.is_err(), "device received bytes for an invalid command");
        session.close().await;
    }

    #[tokio::test]
    async fn command_without_device_reports_not_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let bridge = quick_bridge();
        let (session, mut events) =
            SessionGateway::open(bridge.clone(), DeviceAddress::new("127.0.0.1", port)).await;
        let status = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(status, BridgeEvent::Status { connected: false, .. }));

        assert_eq!(
            session.handle_text(r#"{"cmd":"S","intensity":0}"#).await,
            Some(ServerMessage::error("device not connected"))
        );
        session.close().await;
    }

    #[tokio::test]
    async fn non_command_objects_are_ignored() {
        let bridge = quick_bridge();
        let (session, _events) =
            SessionGateway::open(bridge.clone(), DeviceAddress::new("127.0.0.1", 9)).await;
        assert_eq!(session.handle_text(r#"{"note":"hi"}"#).await, None);
        assert!(matches!(
            session.handle_text("{broken").await,
            Some(ServerMessage::Error { .. })
        ));
        session.close().await;
    }
}
