use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::address::AgentAddress;
use crate::envelope::Envelope;
use crate::error::FragmentError;

/// Smallest usable per-message limit: one UTF-8 scalar can take 4 bytes, so
/// anything below this cannot make forward progress.
pub const MIN_MESSAGE_SIZE: usize = 4;

const KEY_ID: &str = "frag.id";
const KEY_INDEX: &str = "frag.index";
const KEY_TOTAL: &str = "frag.total";
const KEY_LEN: &str = "frag.len";

/// Reassembly metadata carried on every fragment. Lives only while the
/// transfer is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Stable correlation id, derived from (sender, thread) at split time.
    pub correlation: String,
    /// 0-based index of this fragment.
    pub index: usize,
    /// Total fragment count for the transfer.
    pub total: usize,
    /// Byte length of the original payload, for post-assembly sanity.
    pub payload_len: usize,
}

impl FragmentHeader {
    /// Extracts the header from an envelope's metadata.
    pub fn from_envelope(env: &Envelope) -> Result<Self, FragmentError> {
        fn field<T: std::str::FromStr>(
            env: &Envelope,
            key: &'static str,
        ) -> Result<T, FragmentError> {
            env.metadata
                .get(key)
                .and_then(|v| v.parse().ok())
                .ok_or(FragmentError::MalformedHeader { key })
        }

        let header = FragmentHeader {
            correlation: env
                .metadata
                .get(KEY_ID)
                .cloned()
                .ok_or(FragmentError::MalformedHeader { key: KEY_ID })?,
            index: field(env, KEY_INDEX)?,
            total: field(env, KEY_TOTAL)?,
            payload_len: field(env, KEY_LEN)?,
        };
        if header.total == 0 || header.index >= header.total {
            return Err(FragmentError::IndexOutOfRange {
                index: header.index,
                total: header.total,
            });
        }
        Ok(header)
    }

    fn apply(&self, env: &mut Envelope) {
        env.metadata.insert(KEY_ID.into(), self.correlation.clone());
        env.metadata.insert(KEY_INDEX.into(), self.index.to_string());
        env.metadata.insert(KEY_TOTAL.into(), self.total.to_string());
        env.metadata.insert(KEY_LEN.into(), self.payload_len.to_string());
    }
}

fn correlation_id(sender: &AgentAddress, thread: &str) -> String {
    format!("{}#{}", sender.bare(), thread)
}

/// Splits a body into chunks of at most `max` bytes, never inside a UTF-8
/// scalar. Requires `max >= MIN_MESSAGE_SIZE`.
fn chunk_utf8(s: &str, max: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0;
    for (idx, ch) in s.char_indices() {
        if idx + ch.len_utf8() - start > max {
            chunks.push(&s[start..idx]);
            start = idx;
        }
    }
    if start < s.len() {
        chunks.push(&s[start..]);
    }
    chunks
}

/// Splits an envelope into size-bounded fragments. A body that already fits
/// is returned untouched as a single envelope, with no header overhead.
///
/// Each fragment carries a [`FragmentHeader`] in its metadata so the
/// receiver can determine multiplicity, index and correlation id without
/// external context. Fragments of one transfer share a thread id; a fresh
/// one is minted when the caller set none.
pub fn split(envelope: Envelope, max_size: usize) -> Result<Vec<Envelope>, FragmentError> {
    if max_size < MIN_MESSAGE_SIZE {
        return Err(FragmentError::MessageSizeTooSmall(max_size));
    }
    if envelope.body_len() <= max_size {
        return Ok(vec![envelope]);
    }

    let thread = envelope
        .thread
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let correlation = correlation_id(&envelope.sender, &thread);
    let payload_len = envelope.body_len();
    let chunks = chunk_utf8(&envelope.body, max_size);
    let total = chunks.len();

    let mut fragments = Vec::with_capacity(total);
    for (index, chunk) in chunks.into_iter().enumerate() {
        let mut frag = envelope.clone();
        frag.body = chunk.to_string();
        frag.thread = Some(thread.clone());
        FragmentHeader {
            correlation: correlation.clone(),
            index,
            total,
            payload_len,
        }
        .apply(&mut frag);
        fragments.push(frag);
    }
    Ok(fragments)
}

/// True when the envelope carries fragmentation metadata and must go through
/// [`FragmentCodec::reassemble`]; false means it is a complete message as-is.
pub fn is_fragment(env: &Envelope) -> bool {
    env.metadata.contains_key(KEY_TOTAL)
}

#[derive(Debug)]
struct ReassemblyBuffer {
    total: usize,
    payload_len: usize,
    chunks: HashMap<usize, String>,
    last_update: Instant,
}

impl ReassemblyBuffer {
    fn new(total: usize, payload_len: usize) -> Self {
        Self {
            total,
            payload_len,
            chunks: HashMap::new(),
            last_update: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        (0..self.total).all(|i| self.chunks.contains_key(&i))
    }

    fn assemble(mut self) -> String {
        let mut body = String::with_capacity(self.payload_len);
        for i in 0..self.total {
            if let Some(chunk) = self.chunks.remove(&i) {
                body.push_str(&chunk);
            }
        }
        body
    }
}

/// Receiver-side reassembly state: one buffer per in-flight multipart
/// transfer, keyed by correlation id. Owned by exactly one receive loop;
/// completion is an index-coverage test, so arrival order never matters.
#[derive(Debug, Default)]
pub struct FragmentCodec {
    buffers: HashMap<String, ReassemblyBuffer>,
}

impl FragmentCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one fragment. Returns the fully rebuilt envelope exactly once,
    /// when every index in `[0, total)` has been seen; `None` means the
    /// transfer is still incomplete (not an error). A duplicate index is
    /// overwritten idempotently, last write wins.
    pub fn reassemble(&mut self, env: Envelope) -> Result<Option<Envelope>, FragmentError> {
        let header = FragmentHeader::from_envelope(&env)?;
        let buffer = self
            .buffers
            .entry(header.correlation.clone())
            .or_insert_with(|| ReassemblyBuffer::new(header.total, header.payload_len));
        buffer.chunks.insert(header.index, env.body.clone());
        buffer.last_update = Instant::now();

        if !buffer.is_complete() {
            return Ok(None);
        }

        let Some(buffer) = self.buffers.remove(&header.correlation) else {
            return Ok(None);
        };
        let payload_len = buffer.payload_len;
        let body = buffer.assemble();
        if body.len() != payload_len {
            tracing::warn!(
                correlation = %header.correlation,
                expected = payload_len,
                actual = body.len(),
                "reassembled payload length differs from header"
            );
        }

        let mut rebuilt = env;
        rebuilt.body = body;
        rebuilt.metadata.remove(KEY_ID);
        rebuilt.metadata.remove(KEY_INDEX);
        rebuilt.metadata.remove(KEY_TOTAL);
        rebuilt.metadata.remove(KEY_LEN);
        Ok(Some(rebuilt))
    }

    /// Whether any reassembly is still in flight. Callers use this to decide
    /// whether to keep polling before shutting down.
    pub fn any_pending(&self) -> bool {
        !self.buffers.is_empty()
    }

    /// Drops buffers that have not seen a fragment within `max_age`. Returns
    /// how many transfers were abandoned.
    pub fn prune_stale(&mut self, max_age: Duration) -> usize {
        let before = self.buffers.len();
        self.buffers
            .retain(|_, buf| buf.last_update.elapsed() < max_age);
        before - self.buffers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Conversation;

    fn envelope(body: &str) -> Envelope {
        Envelope::new(
            "a0@localhost".parse().unwrap(),
            "a1@localhost".parse().unwrap(),
            Conversation::Layers,
            body,
        )
    }

    #[test]
    fn test_small_payload_single_envelope() {
        let fragments = split(envelope("tiny"), 100).unwrap();
        assert_eq!(fragments.len(), 1);
        assert!(!is_fragment(&fragments[0]));
        assert_eq!(fragments[0].body, "tiny");
    }

    #[test]
    fn test_round_trip_in_order() {
        let body: String = "0123456789".repeat(25);
        let fragments = split(envelope(&body), 64).unwrap();
        assert!(fragments.len() > 1);
        assert!(fragments.iter().all(|f| f.body.len() <= 64));

        let mut codec = FragmentCodec::new();
        let mut rebuilt = None;
        for frag in fragments {
            assert!(is_fragment(&frag));
            if let Some(done) = codec.reassemble(frag).unwrap() {
                assert!(rebuilt.is_none(), "completed more than once");
                rebuilt = Some(done);
            }
        }
        let rebuilt = rebuilt.expect("reassembly never completed");
        assert_eq!(rebuilt.body, body);
        assert!(!is_fragment(&rebuilt));
        assert!(!codec.any_pending());
    }

    #[test]
    fn test_round_trip_all_permutations() {
        let body: String = "abcdefgh".repeat(4);
        let fragments = split(envelope(&body), 8).unwrap();
        assert_eq!(fragments.len(), 4);

        // All 24 arrival orders of 4 fragments.
        let orders: Vec<Vec<usize>> = permutations(&[0, 1, 2, 3]);
        for order in orders {
            let mut codec = FragmentCodec::new();
            let mut completions = 0;
            for &i in &order {
                if let Some(done) = codec.reassemble(fragments[i].clone()).unwrap() {
                    completions += 1;
                    assert_eq!(done.body, body, "order {order:?}");
                }
            }
            assert_eq!(completions, 1, "order {order:?}");
        }
    }

    fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for (i, &head) in items.iter().enumerate() {
            let mut rest = items.to_vec();
            rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head);
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn test_duplicate_fragment_is_idempotent() {
        let body: String = "xy".repeat(40);
        let fragments = split(envelope(&body), 16).unwrap();

        let mut codec = FragmentCodec::new();
        // Deliver the first fragment three times before the rest.
        assert!(codec.reassemble(fragments[0].clone()).unwrap().is_none());
        assert!(codec.reassemble(fragments[0].clone()).unwrap().is_none());
        assert!(codec.reassemble(fragments[0].clone()).unwrap().is_none());
        let mut rebuilt = None;
        for frag in &fragments[1..] {
            if let Some(done) = codec.reassemble(frag.clone()).unwrap() {
                rebuilt = Some(done);
            }
        }
        assert_eq!(rebuilt.unwrap().body, body);
    }

    #[test]
    fn test_never_completes_early() {
        let body: String = "z".repeat(100);
        let fragments = split(envelope(&body), 10).unwrap();
        let total = fragments.len();

        let mut codec = FragmentCodec::new();
        for frag in fragments.into_iter().take(total - 1) {
            assert!(codec.reassemble(frag).unwrap().is_none());
        }
        assert!(codec.any_pending());
    }

    #[test]
    fn test_multibyte_bodies_split_on_char_boundaries() {
        let body: String = "héllo wörld ←→ ".repeat(12);
        let fragments = split(envelope(&body), 7).unwrap();
        for frag in &fragments {
            assert!(frag.body.len() <= 7);
            assert!(!frag.body.is_empty());
        }
        let mut codec = FragmentCodec::new();
        let mut rebuilt = None;
        for frag in fragments {
            if let Some(done) = codec.reassemble(frag).unwrap() {
                rebuilt = Some(done);
            }
        }
        assert_eq!(rebuilt.unwrap().body, body);
    }

    #[test]
    fn test_concurrent_transfers_do_not_collide() {
        let body_a: String = "A".repeat(50);
        let body_b: String = "B".repeat(50);
        let frags_a = split(envelope(&body_a).with_thread("t-a"), 10).unwrap();
        let frags_b = split(envelope(&body_b).with_thread("t-b"), 10).unwrap();

        // Interleave the two transfers fragment by fragment.
        let mut codec = FragmentCodec::new();
        let mut done = Vec::new();
        for (a, b) in frags_a.into_iter().zip(frags_b.into_iter()) {
            if let Some(d) = codec.reassemble(a).unwrap() {
                done.push(d.body);
            }
            if let Some(d) = codec.reassemble(b).unwrap() {
                done.push(d.body);
            }
        }
        assert_eq!(done, vec![body_a, body_b]);
    }

    #[test]
    fn test_malformed_header_rejected() {
        let mut env = envelope("chunk");
        env.metadata.insert("frag.total".into(), "3".into());
        // frag.id, frag.index, frag.len missing
        let mut codec = FragmentCodec::new();
        assert!(codec.reassemble(env).is_err());
        assert!(!codec.any_pending());
    }

    #[test]
    fn test_index_out_of_range_rejected() {
        let body: String = "q".repeat(30);
        let mut fragments = split(envelope(&body), 10).unwrap();
        let mut bad = fragments.remove(0);
        bad.metadata.insert("frag.index".into(), "99".into());
        let mut codec = FragmentCodec::new();
        assert!(matches!(
            codec.reassemble(bad),
            Err(FragmentError::IndexOutOfRange { index: 99, .. })
        ));
    }

    #[test]
    fn test_prune_stale_abandons_incomplete() {
        let body: String = "s".repeat(40);
        let fragments = split(envelope(&body), 10).unwrap();
        let mut codec = FragmentCodec::new();
        codec.reassemble(fragments[0].clone()).unwrap();
        assert!(codec.any_pending());
        assert_eq!(codec.prune_stale(Duration::ZERO), 1);
        assert!(!codec.any_pending());
    }

    #[test]
    fn test_size_limit_validated() {
        assert!(split(envelope(&"x".repeat(10)), 2).is_err());
    }
}
