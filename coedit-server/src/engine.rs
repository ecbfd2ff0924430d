//! Serialized edit pipeline: transform against the buffered history tail,
//! apply, bump the version, persist.

use chrono::Utc;
use std::collections::VecDeque;

use crate::Identifier;
use crate::error::{Error, Result};
use crate::ot::{self, Operation};
use crate::store::DocumentStore;

/// Transformed operations retained per document, oldest dropped. Clients
/// lagging further behind than this must re-join.
pub const BUFFER_LIMIT: usize = 200;

/// The most recent `(version, operation)` pairs accepted for one document,
/// strictly monotone in version.
#[derive(Default)]
pub struct OpBuffer {
    entries: VecDeque<(u64, Operation)>,
}

impl OpBuffer {
    /// Entries with `version > base`, in increasing version order.
    pub fn since(&self, base: u64) -> impl Iterator<Item = &(u64, Operation)> {
        self.entries.iter().filter(move |(version, _)| *version > base)
    }

    /// Append an accepted operation. Entries arriving out of order or
    /// already recorded (a re-delivered bus message) are dropped to keep
    /// versions strictly monotone.
    pub fn push(&mut self, version: u64, op: Operation) {
        if self.entries.back().is_some_and(|(last, _)| *last >= version) {
            return;
        }
        self.entries.push_back((version, op));
        while self.entries.len() > BUFFER_LIMIT {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of accepting an operation. `operation` is `Noop` when the
/// transform collapsed it, in which case `version` is unchanged.
#[derive(Clone, Debug)]
pub struct Accepted {
    pub operation: Operation,
    pub version: u64,
}

/// Run one client operation through transform, apply and persist.
///
/// The caller must hold the per-document lock for the whole call: buffer
/// update and the durable write have to stay ordered with respect to other
/// writers on the same document.
pub async fn process_operation(
    store: &dyn DocumentStore,
    buffer: &mut OpBuffer,
    document_id: &Identifier,
    mut op: Operation,
    user_id: &Identifier,
) -> Result<Accepted> {
    let mut document = store.get_by_id(document_id).await?.ok_or(Error::NotFound)?;

    // Roles may change mid-session; the check rides the same fetch the
    // transform works from.
    if !crate::permission::resolve_role(&document, user_id).can_edit() {
        return Err(Error::Forbidden);
    }

    let content_len = ot::utf16_len(&document.content);
    if !op.validate(content_len) {
        return Err(Error::InvalidOperation(
            "operation shape is invalid for this document".to_string(),
        ));
    }

    let base_version = op
        .base_version()
        .ok_or_else(|| Error::InvalidOperation("clients may not send noop".to_string()))?;

    if base_version > document.version {
        return Err(Error::InvalidBaseVersion {
            base: base_version,
            current: document.version,
        });
    }

    if base_version < document.version {
        // The buffer must cover every version in (base, current]; on a
        // fleet, operations accepted by peer instances land here through
        // bus ingress and may not have arrived yet.
        let needed = document.version - base_version;
        let tail: Vec<_> = buffer.since(base_version).collect();
        if (tail.len() as u64) < needed {
            return Err(Error::Transient(
                "operation history is not yet available here, resubmit or re-join".to_string(),
            ));
        }
        for (_, accepted) in tail {
            op = ot::transform(op, accepted);
            if op.is_noop() {
                break;
            }
        }
    }

    if op.is_noop() {
        // Collapsed edits leave no trace: no snapshot, no version bump.
        return Ok(Accepted {
            operation: Operation::Noop,
            version: document.version,
        });
    }

    document.push_history(user_id.clone(), Utc::now());
    document.content = ot::apply(&document.content, &op);
    document.version += 1;
    store.save(&document).await?;

    buffer.push(document.version, op.clone());

    Ok(Accepted {
        operation: op,
        version: document.version,
    })
}
