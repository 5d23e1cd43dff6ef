//! Fire-and-forget participant notifications.
//!
//! Delivery is someone else's concern: the service hands each event to a
//! [`Notifier`] and moves on. Failures are logged, never surfaced.

use serde::Serialize;
use tokio::sync::mpsc;

use kinmerge_core::FamilyCode;
use kinmerge_storage::{MergeRequestId, TreeLinkRequestId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ParticipantEvent {
    MergeInitiated {
        merge_request: MergeRequestId,
        primary: FamilyCode,
        secondary: FamilyCode,
    },
    MergeCompleted {
        merge_request: MergeRequestId,
        primary: FamilyCode,
        secondary: FamilyCode,
    },
    MergeRejected {
        merge_request: MergeRequestId,
        primary: FamilyCode,
        secondary: FamilyCode,
        reason: String,
    },
    LinkRequested {
        link: TreeLinkRequestId,
        receiver_family: FamilyCode,
    },
    LinkRevoked {
        link: TreeLinkRequestId,
        receiver_family: FamilyCode,
    },
    LinkRejected {
        link: TreeLinkRequestId,
        sender_family: FamilyCode,
    },
    LinkExecuted {
        link: TreeLinkRequestId,
        sender_family: FamilyCode,
        receiver_family: FamilyCode,
    },
    LinkExecutionFailed {
        link: TreeLinkRequestId,
        error: String,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: ParticipantEvent);
}

/// Logs every event at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: ParticipantEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "kinmerge::notify", "{}", json),
            Err(e) => tracing::warn!("failed to encode participant event: {}", e),
        }
    }
}

/// Forwards events to an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ParticipantEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ParticipantEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelNotifier { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: ParticipantEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::warn!("participant event dropped, receiver closed: {:?}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_notifier_delivers_in_order() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(ParticipantEvent::LinkRequested {
            link: TreeLinkRequestId(1),
            receiver_family: FamilyCode::new("B"),
        });
        notifier.notify(ParticipantEvent::LinkRevoked {
            link: TreeLinkRequestId(1),
            receiver_family: FamilyCode::new("B"),
        });
        assert!(matches!(
            rx.recv().await,
            Some(ParticipantEvent::LinkRequested { .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ParticipantEvent::LinkRevoked { .. })
        ));
    }

    #[test]
    fn closed_channel_does_not_panic() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.notify(ParticipantEvent::LinkExecutionFailed {
            link: TreeLinkRequestId(3),
            error: "gone".into(),
        });
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(ParticipantEvent::MergeRejected {
            merge_request: MergeRequestId(4),
            primary: FamilyCode::new("A"),
            secondary: FamilyCode::new("B"),
            reason: "duplicate".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "merge_rejected");
        assert_eq!(json["merge_request"], 4);
        assert_eq!(json["primary"], "A");
    }
}
