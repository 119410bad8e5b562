use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::address::AgentAddress;

/// Classifies what an envelope's body carries so the receiving side can
/// dispatch without parsing the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conversation {
    /// A consensus payload: named layer tensors from one peer.
    Layers,
    /// A similarity vector.
    Similarity,
}

impl Conversation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conversation::Layers => "layers",
            Conversation::Similarity => "similarity",
        }
    }
}

/// One outbound/inbound unit on the messaging substrate.
///
/// Created per send; consumed by the receiving side's dispatch. The body is
/// opaque to the transport — only the conversation tag, the optional thread
/// id and the `frag.*` metadata keys are interpreted below the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: AgentAddress,
    pub to: AgentAddress,
    pub conversation: Conversation,
    /// Correlation thread id. Replies and fragments of one logical transfer
    /// share it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    pub body: String,
}

impl Envelope {
    pub fn new(
        sender: AgentAddress,
        to: AgentAddress,
        conversation: Conversation,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender,
            to,
            conversation,
            thread: None,
            metadata: HashMap::new(),
            body: body.into(),
        }
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    /// Body size in bytes, the quantity the per-message limit applies to.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let mut env = Envelope::new(
            "a0@localhost".parse().unwrap(),
            "a1@localhost".parse().unwrap(),
            Conversation::Similarity,
            "{}",
        )
        .with_thread("t-1");
        env.metadata.insert("k".into(), "v".into());

        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sender.to_string(), "a0@localhost");
        assert_eq!(back.conversation, Conversation::Similarity);
        assert_eq!(back.thread.as_deref(), Some("t-1"));
        assert_eq!(back.metadata.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_conversation_tag_is_snake_case() {
        let json = serde_json::to_string(&Conversation::Layers).unwrap();
        assert_eq!(json, "\"layers\"");
    }
}
