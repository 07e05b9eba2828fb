//! Host events
//!
//! Lifecycle notifications for the embedding application, in the JSON shape
//! the host bridge expects: `{"type":"WEBRTC_READY"}`,
//! `{"type":"WEBRTC_ERROR","error":...}` and `{"type":"WEBRTC_MESSAGE","data":...}`.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use rtc_core::{CallError, ErrorCode};

/// Event posted to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostEvent {
    /// Coordinator loaded and authenticated
    #[serde(rename = "WEBRTC_READY")]
    Ready,

    /// Something went wrong; `code` is absent for media failures
    #[serde(rename = "WEBRTC_ERROR")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },

    /// A call event (state change, peer event, relayed message)
    #[serde(rename = "WEBRTC_MESSAGE")]
    Message { data: serde_json::Value },
}

impl HostEvent {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<&CallError> for HostEvent {
    fn from(e: &CallError) -> Self {
        Self::Error {
            error: e.to_string(),
            code: Some(ErrorCode::from(e)),
        }
    }
}

/// Sending half of the host event channel
#[derive(Debug, Clone)]
pub struct HostNotifier {
    tx: mpsc::UnboundedSender<HostEvent>,
}

/// Receiving half of the host event channel
#[derive(Debug)]
pub struct HostEvents {
    rx: mpsc::UnboundedReceiver<HostEvent>,
}

impl HostNotifier {
    /// Create a connected notifier and receiver
    pub fn channel() -> (HostNotifier, HostEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (HostNotifier { tx }, HostEvents { rx })
    }

    /// Post an event; a host that stopped listening is not an error
    pub fn notify(&self, event: HostEvent) {
        if self.tx.send(event).is_err() {
            debug!("Host event dropped: receiver gone");
        }
    }

    pub fn ready(&self) {
        self.notify(HostEvent::Ready);
    }

    pub fn error(&self, e: &CallError) {
        self.notify(HostEvent::from(e));
    }

    pub fn message(&self, data: serde_json::Value) {
        self.notify(HostEvent::Message { data });
    }
}

impl HostEvents {
    pub async fn recv(&mut self) -> Option<HostEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HostEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtc_core::AuthError;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(HostEvent::Ready.to_json().unwrap(), r#"{"type":"WEBRTC_READY"}"#);

        let err = CallError::from(AuthError::MissingIdentity);
        let json = HostEvent::from(&err).to_json().unwrap();
        assert!(json.contains(r#""type":"WEBRTC_ERROR""#));
        assert!(json.contains(r#""code":"missing_identity""#));

        let msg = HostEvent::Message {
            data: serde_json::json!({"type": "state_changed", "state": "active"}),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "WEBRTC_MESSAGE");
        assert_eq!(value["data"]["state"], "active");
    }

    #[test]
    fn test_host_bridge_error_without_code() {
        let event = HostEvent::from_json(r#"{"type":"WEBRTC_ERROR","error":"script failed"}"#).unwrap();
        assert_eq!(
            event,
            HostEvent::Error {
                error: "script failed".into(),
                code: None
            }
        );
    }

    #[test]
    fn test_unknown_type_is_error() {
        assert!(HostEvent::from_json(r#"{"type":"WEBRTC_SOMETHING"}"#).is_err());
    }

    #[test]
    fn test_recv_waits_for_events() {
        let (notifier, mut events) = HostNotifier::channel();
        {
            let mut recv = tokio_test::task::spawn(events.recv());
            tokio_test::assert_pending!(recv.poll());

            notifier.ready();
            assert!(recv.is_woken());
            tokio_test::assert_ready_eq!(recv.poll(), Some(HostEvent::Ready));
        }
        assert_eq!(events.try_recv(), None);
    }

    #[tokio::test]
    async fn test_notifier_survives_closed_host() {
        let (notifier, mut events) = HostNotifier::channel();
        notifier.ready();
        assert_eq!(events.recv().await, Some(HostEvent::Ready));

        drop(events);
        notifier.ready();
    }
}
