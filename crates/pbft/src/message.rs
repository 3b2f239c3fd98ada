//! PBFT protocol messages.

use concord_types::{message_tag, Digest, NodeId};
use serde::{Deserialize, Serialize};

/// The three protocol phases a message can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PbftMessageKind {
    PrePrepare,
    Prepare,
    Commit,
}

/// One PBFT protocol message.
///
/// `request` is present only on PRE_PREPARE. The `tag` is a keyed integrity
/// check over `(sender, view, sequence, digest)` under the cluster secret;
/// it is not a signature, and cross-node trust is out of scope.
///
/// Duplicate delivery is safe: receivers key messages by
/// `(view, sequence, sender, type)` and ignore repeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PbftMessage {
    #[serde(rename = "type")]
    pub kind: PbftMessageKind,
    pub view: u64,
    pub sequence: u64,
    pub digest: Digest,
    pub sender: NodeId,
    pub tag: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<serde_json::Value>,
}

impl PbftMessage {
    /// Build a message with a freshly computed tag.
    pub fn tagged(
        kind: PbftMessageKind,
        view: u64,
        sequence: u64,
        digest: Digest,
        sender: NodeId,
        secret: &str,
        request: Option<serde_json::Value>,
    ) -> Self {
        let tag = message_tag(sender.as_str(), view, sequence, &digest, secret);
        Self {
            kind,
            view,
            sequence,
            digest,
            sender,
            tag,
            request,
        }
    }

    /// Recompute and check the tag under the given secret.
    pub fn tag_valid(&self, secret: &str) -> bool {
        let expected = message_tag(
            self.sender.as_str(),
            self.view,
            self.sequence,
            &self.digest,
            secret,
        );
        self.tag == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_message_validates() {
        let digest = Digest::of_value(&json!({"op": "noop"}));
        let msg = PbftMessage::tagged(
            PbftMessageKind::Prepare,
            0,
            1,
            digest,
            NodeId::new("n1"),
            "secret",
            None,
        );
        assert!(msg.tag_valid("secret"));
        assert!(!msg.tag_valid("other-secret"));
    }

    #[test]
    fn tampering_breaks_the_tag() {
        let digest = Digest::of_value(&json!({"op": "noop"}));
        let mut msg = PbftMessage::tagged(
            PbftMessageKind::Commit,
            0,
            7,
            digest,
            NodeId::new("n1"),
            "secret",
            None,
        );
        msg.sequence = 8;
        assert!(!msg.tag_valid("secret"));
    }

    #[test]
    fn wire_format_uses_type_field() {
        let digest = Digest::of_bytes(b"r");
        let msg = PbftMessage::tagged(
            PbftMessageKind::PrePrepare,
            0,
            1,
            digest,
            NodeId::new("n1"),
            "s",
            Some(json!({"k": 1})),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "PRE_PREPARE");
        assert_eq!(value["sequence"], 1);
        let back: PbftMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
