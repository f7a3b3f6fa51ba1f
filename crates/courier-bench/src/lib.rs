//! Fixtures shared by the Courier benchmarks.

use courier_core::{ConnectionId, Outbound, PubSub, RoomRouter};
use courier_protocol::{Message, MessageKind, SyncStatus};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// A direct message of `size` bytes of content.
#[must_use]
pub fn sample_message(size: usize) -> Message {
    Message {
        id: "msg-1".into(),
        sender_id: "bob".into(),
        recipient_id: Some("alice".into()),
        group_id: None,
        conversation_id: "conv-1".into(),
        content: "x".repeat(size),
        kind: MessageKind::Text,
        attachments: vec![],
        timestamp: 1_700_000_000_000,
        read_by: vec![],
        sync_status: SyncStatus::Synced,
        is_edited: false,
        edited_at: None,
        reply_to_id: None,
    }
}

/// A router with `members` connections joined to `room`.
///
/// The receivers must be kept alive (and drained) by the caller, otherwise
/// sends fail fast and the benchmark measures the wrong path.
#[must_use]
pub fn populated_room(room: &str, members: usize) -> (RoomRouter, Vec<UnboundedReceiver<Outbound>>) {
    let router = RoomRouter::new();
    let mut receivers = Vec::with_capacity(members);

    for i in 0..members {
        let (tx, rx) = mpsc::unbounded_channel();
        let member = ConnectionId::new(format!("conn_{}", i));
        router.attach(member.clone(), tx);
        if router.join(&member, room).is_ok() {
            receivers.push(rx);
        }
    }

    (router, receivers)
}

/// Discard everything buffered in `receivers`.
pub fn drain(receivers: &mut [UnboundedReceiver<Outbound>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}
