//! Conformant client-side editing state machine.
//!
//! A client keeps a FIFO queue of pending local operations and at most one
//! operation in flight. The base version is stamped when an operation is
//! sent, not when the edit happened, so the server only ever transforms it
//! against operations the client has not yet applied.
//!
//! Alongside the visible text the client tracks a shadow copy of the
//! server's content at the last known version. Remote operations are applied
//! to the shadow and the pending edits are rebased on top, which keeps the
//! visible text convergent with the server even while edits are in flight.

use std::collections::VecDeque;

use crate::ot::{self, Operation};

impl Operation {
    fn with_base(self, base: u64) -> Operation {
        match self {
            Operation::Insert { position, text, .. } => Operation::Insert {
                position,
                text,
                base_version: base,
            },
            Operation::Delete {
                position, length, ..
            } => Operation::Delete {
                position,
                length,
                base_version: base,
            },
            Operation::Noop => Operation::Noop,
        }
    }
}

/// Client editing state for one document.
#[derive(Debug, Default)]
pub struct EditorClient {
    /// Server content at `version`.
    shadow: String,
    /// Shadow plus the pending local edits.
    content: String,
    version: u64,
    queue: VecDeque<Operation>,
    /// The sent-but-unacknowledged operation, kept rebased for display. It
    /// may collapse to noop locally; the slot stays occupied until the ack.
    in_flight: Option<Operation>,
}

impl EditorClient {
    /// State after receiving `document_state`.
    pub fn from_document_state(content: &str, version: u64) -> Self {
        Self {
            shadow: content.to_string(),
            content: content.to_string(),
            version,
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len() + usize::from(self.in_flight.is_some())
    }

    /// Record a user edit by diffing the whole new text against the current
    /// one: the changed window is whatever lies between the longest common
    /// prefix and the longest common suffix, yielding at most one delete and
    /// one insert. Applies optimistically and enqueues.
    pub fn edit(&mut self, new_text: &str) {
        let old: Vec<u16> = self.content.encode_utf16().collect();
        let new: Vec<u16> = new_text.encode_utf16().collect();

        let mut prefix = 0;
        while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
            prefix += 1;
        }
        let mut suffix = 0;
        while suffix < old.len() - prefix
            && suffix < new.len() - prefix
            && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
        {
            suffix += 1;
        }

        let removed = old.len() - prefix - suffix;
        let inserted = &new[prefix..new.len() - suffix];

        if removed > 0 {
            self.queue.push_back(Operation::Delete {
                position: prefix as u32,
                length: removed as u32,
                base_version: 0,
            });
        }
        if !inserted.is_empty() {
            self.queue.push_back(Operation::Insert {
                position: prefix as u32,
                text: String::from_utf16_lossy(inserted),
                base_version: 0,
            });
        }
        self.content = new_text.to_string();
    }

    /// If nothing is in flight and the queue is non-empty, take the head,
    /// stamp it with the current known version and mark it in flight. The
    /// caller sends the returned operation.
    pub fn try_send_next(&mut self) -> Option<Operation> {
        if self.in_flight.is_some() {
            return None;
        }
        let op = self.queue.pop_front()?.with_base(self.version);
        self.in_flight = Some(op.clone());
        Some(op)
    }

    /// Handle `operation_ack`: the ack carries the operation as the server
    /// accepted it, which advances the shadow. Returns the next operation to
    /// send, if any.
    pub fn on_ack(&mut self, accepted: &Operation, version: u64) -> Option<Operation> {
        self.shadow = ot::apply(&self.shadow, accepted);
        self.version = version;
        self.in_flight = None;
        self.rebuild_content();
        self.try_send_next()
    }

    /// Handle `remote_operation`: advance the shadow, rebase the pending
    /// edits across the accepted operation and rebuild the visible text.
    /// The operation actually sitting on the wire is never altered; only
    /// its local image moves, mirroring the transform the server will run.
    pub fn on_remote(&mut self, op: &Operation, version: u64) {
        if version <= self.version {
            return;
        }
        self.shadow = ot::apply(&self.shadow, op);
        self.version = version;

        let mut accepted = op.clone();
        if let Some(pending) = &mut self.in_flight {
            let previous = pending.clone();
            *pending = ot::transform(previous.clone(), &accepted);
            accepted = ot::transform_accepted(accepted, &previous);
        }
        let mut rebased = VecDeque::with_capacity(self.queue.len());
        for queued in self.queue.drain(..) {
            let transformed = ot::transform(queued.clone(), &accepted);
            accepted = ot::transform_accepted(accepted, &queued);
            if !transformed.is_noop() {
                rebased.push_back(transformed);
            }
        }
        self.queue = rebased;
        self.rebuild_content();
    }

    /// Handle re-join: the fresh `document_state` is authoritative and any
    /// pending work is dropped.
    pub fn rejoin(&mut self, content: &str, version: u64) {
        self.shadow = content.to_string();
        self.content = content.to_string();
        self.version = version;
        self.queue.clear();
        self.in_flight = None;
    }

    fn rebuild_content(&mut self) {
        let mut content = self.shadow.clone();
        if let Some(pending) = &self.in_flight {
            content = ot::apply(&content, pending);
        }
        for queued in &self.queue {
            content = ot::apply(&content, queued);
        }
        self.content = content;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(position: u32, text: &str, base_version: u64) -> Operation {
        Operation::Insert {
            position,
            text: text.to_string(),
            base_version,
        }
    }

    fn delete(position: u32, length: u32, base_version: u64) -> Operation {
        Operation::Delete {
            position,
            length,
            base_version,
        }
    }

    #[test]
    fn diff_produces_minimal_insert() {
        let mut client = EditorClient::from_document_state("hello world", 1);
        client.edit("hello brave world");
        assert_eq!(client.content(), "hello brave world");
        assert_eq!(client.try_send_next(), Some(insert(6, "brave ", 1)));
    }

    #[test]
    fn diff_produces_delete_and_insert_pair() {
        let mut client = EditorClient::from_document_state("hello world", 1);
        client.edit("hello there");
        let first = client.try_send_next().unwrap();
        assert_eq!(first, delete(6, 5, 1));
        // Second op waits for the first ack.
        assert_eq!(client.try_send_next(), None);
        let second = client.on_ack(&delete(6, 5, 1), 2).unwrap();
        assert_eq!(second, insert(6, "there", 2));
        let done = client.on_ack(&insert(6, "there", 2), 3);
        assert_eq!(done, None);
        assert_eq!(client.content(), "hello there");
        assert_eq!(client.version(), 3);
    }

    #[test]
    fn at_most_one_in_flight() {
        let mut client = EditorClient::from_document_state("", 1);
        client.edit("a");
        client.edit("ab");
        client.edit("abc");

        let first = client.try_send_next().unwrap();
        assert!(client.has_in_flight());
        assert_eq!(client.try_send_next(), None);
        assert_eq!(client.try_send_next(), None);

        let second = client.on_ack(&first, 2).unwrap();
        assert_eq!(client.try_send_next(), None);
        let third = client.on_ack(&second, 3).unwrap();
        assert!(client.on_ack(&third, 4).is_none());
        assert_eq!(client.pending_len(), 0);
        assert_eq!(client.content(), "abc");
    }

    #[test]
    fn base_version_is_stamped_at_send_time() {
        let mut client = EditorClient::from_document_state("", 1);
        client.edit("x");
        // A remote operation lands before we get to send.
        client.on_remote(&insert(0, "r", 1), 2);
        let sent = client.try_send_next().unwrap();
        assert_eq!(sent.base_version(), Some(2));
    }

    #[test]
    fn queued_edits_follow_remote_operations() {
        let mut client = EditorClient::from_document_state("abc", 1);
        client.edit("abcx");
        // Remote insert at the front shifts the queued edit right.
        client.on_remote(&insert(0, "!!", 1), 2);
        assert_eq!(client.content(), "!!abcx");
        assert_eq!(client.try_send_next(), Some(insert(5, "x", 2)));
    }

    #[test]
    fn remote_insert_past_an_in_flight_insert_stays_behind_it() {
        // In-flight "A" at the front; a remote insert composed without it
        // must land where the server will put it.
        let mut client = EditorClient::from_document_state("XY", 1);
        client.edit("AXY");
        let sent = client.try_send_next().unwrap();
        assert_eq!(sent, insert(0, "A", 1));

        client.on_remote(&insert(2, "B", 1), 2);
        assert_eq!(client.content(), "AXYB");

        // The server transforms our op not at all (it comes first in its
        // history fold) and acks it unchanged.
        client.on_ack(&insert(0, "A", 1), 3);
        assert_eq!(client.content(), "AXYB");
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn in_flight_swallowed_by_remote_delete_still_blocks_the_queue() {
        let mut client = EditorClient::from_document_state("abcd", 1);
        client.edit("abd");
        let sent = client.try_send_next().unwrap();
        assert_eq!(sent, delete(2, 1, 1));

        // A remote delete covers ours entirely.
        client.on_remote(&delete(1, 3, 1), 2);
        assert_eq!(client.content(), "a");
        // Still waiting for the ack, even though the local image collapsed.
        assert!(client.has_in_flight());
        assert_eq!(client.try_send_next(), None);

        // The server acks it as a noop at the current version.
        client.on_ack(&Operation::Noop, 2);
        assert_eq!(client.content(), "a");
        assert!(!client.has_in_flight());
    }

    #[test]
    fn stale_remote_versions_are_ignored() {
        let mut client = EditorClient::from_document_state("abc", 3);
        client.on_remote(&insert(0, "x", 1), 3);
        assert_eq!(client.content(), "abc");
        assert_eq!(client.version(), 3);
    }

    #[test]
    fn rejoin_drops_pending_work() {
        let mut client = EditorClient::from_document_state("abc", 1);
        client.edit("abcdef");
        client.try_send_next();
        assert!(client.has_in_flight());

        client.rejoin("fresh", 9);
        assert_eq!(client.content(), "fresh");
        assert_eq!(client.version(), 9);
        assert!(!client.has_in_flight());
        assert_eq!(client.pending_len(), 0);
        assert_eq!(client.try_send_next(), None);
    }

    /// A miniature accept loop: fold each incoming operation over the ops
    /// accepted after its base version, exactly like the engine does.
    struct MiniServer {
        accepted: Vec<(u64, Operation)>,
        content: String,
        version: u64,
    }

    impl MiniServer {
        fn new(content: &str) -> Self {
            Self {
                accepted: Vec::new(),
                content: content.to_string(),
                version: 1,
            }
        }

        fn serve(&mut self, op: Operation) -> (Operation, u64) {
            let base = op.base_version().unwrap();
            let mut op = op;
            for (version, other) in &self.accepted {
                if *version > base {
                    op = ot::transform(op, other);
                }
            }
            if op.is_noop() {
                return (op, self.version);
            }
            self.content = ot::apply(&self.content, &op);
            self.version += 1;
            self.accepted.push((self.version, op.clone()));
            (op, self.version)
        }
    }

    #[test]
    fn two_clients_converge_through_a_simulated_server() {
        let mut server = MiniServer::new("AC");
        let mut alice = EditorClient::from_document_state("AC", 1);
        let mut bob = EditorClient::from_document_state("AC", 1);

        // Both insert at position 1 concurrently; the first accepted wins
        // the position and the other shifts right.
        alice.edit("ABC");
        bob.edit("AXC");
        let from_alice = alice.try_send_next().unwrap();
        let from_bob = bob.try_send_next().unwrap();

        let (alice_op, v2) = server.serve(from_alice);
        bob.on_remote(&alice_op, v2);
        alice.on_ack(&alice_op, v2);

        let (bob_op, v3) = server.serve(from_bob);
        alice.on_remote(&bob_op, v3);
        bob.on_ack(&bob_op, v3);

        assert_eq!(server.content, "ABXC");
        assert_eq!(alice.content(), "ABXC");
        assert_eq!(bob.content(), "ABXC");
        assert_eq!(alice.version(), 3);
        assert_eq!(bob.version(), 3);
    }

    #[test]
    fn interleaved_typing_converges() {
        let mut server = MiniServer::new("");
        let mut alice = EditorClient::from_document_state("", 1);
        let mut bob = EditorClient::from_document_state("", 1);

        // Alice types "hey" one character at a time while Bob prepends
        // punctuation; deliveries interleave with sends.
        alice.edit("h");
        alice.edit("he");
        alice.edit("hey");
        bob.edit("!");

        let a1 = alice.try_send_next().unwrap();
        let b1 = bob.try_send_next().unwrap();

        let (a1_acc, v) = server.serve(a1);
        bob.on_remote(&a1_acc, v);
        let a2 = alice.on_ack(&a1_acc, v).unwrap();

        let (b1_acc, v) = server.serve(b1);
        alice.on_remote(&b1_acc, v);
        bob.on_ack(&b1_acc, v);

        let (a2_acc, v) = server.serve(a2);
        bob.on_remote(&a2_acc, v);
        let a3 = alice.on_ack(&a2_acc, v).unwrap();

        let (a3_acc, v) = server.serve(a3);
        bob.on_remote(&a3_acc, v);
        alice.on_ack(&a3_acc, v);

        assert_eq!(alice.content(), bob.content());
        assert_eq!(alice.content(), server.content);
        assert_eq!(alice.pending_len(), 0);
        assert_eq!(bob.pending_len(), 0);
    }
}
