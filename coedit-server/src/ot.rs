//! Operational transformation over linear version history.
//!
//! Positions and lengths count UTF-16 code units, matching textarea-style
//! clients. Out-of-range positions are clamped at apply time.

use serde::{Deserialize, Serialize};

/// An atomic intent to mutate document text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Insert `text` at `position`.
    Insert {
        position: u32,
        text: String,
        #[serde(rename = "baseVersion")]
        base_version: u64,
    },
    /// Delete `length` code units starting at `position`.
    Delete {
        position: u32,
        length: u32,
        #[serde(rename = "baseVersion")]
        base_version: u64,
    },
    /// Produced only by transformation; never sent by clients.
    Noop,
}

impl Operation {
    /// The document version the client believed it was editing against.
    pub fn base_version(&self) -> Option<u64> {
        match self {
            Operation::Insert { base_version, .. } | Operation::Delete { base_version, .. } => {
                Some(*base_version)
            }
            Operation::Noop => None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Operation::Noop)
    }

    /// Shape validation at acceptance: non-empty insert text, delete length
    /// of at least one, position within the current content.
    pub fn validate(&self, content_len: u32) -> bool {
        match self {
            Operation::Insert { position, text, .. } => {
                !text.is_empty() && *position <= content_len
            }
            Operation::Delete {
                position, length, ..
            } => *length >= 1 && *position <= content_len,
            Operation::Noop => true,
        }
    }
}

/// Number of UTF-16 code units in `s`.
pub fn utf16_len(s: &str) -> u32 {
    s.encode_utf16().count() as u32
}

/// Byte offset of the UTF-16 code unit index `target`, clamped to the end.
///
/// An index landing inside a surrogate pair snaps to the start of the
/// following character, so the result is always a char boundary.
fn byte_index(s: &str, target: u32) -> usize {
    let mut units = 0u32;
    for (byte, ch) in s.char_indices() {
        if units >= target {
            return byte;
        }
        units += ch.len_utf16() as u32;
    }
    s.len()
}

/// Transform `a` to apply after `b`, where both share the same base state.
///
/// Server-accepted `b` wins position on insert ties; deletes never absorb
/// concurrently inserted text.
pub fn transform(a: Operation, b: &Operation) -> Operation {
    match (a, b) {
        (a, Operation::Noop) => a,
        (Operation::Noop, _) => Operation::Noop,
        (
            Operation::Insert {
                position,
                text,
                base_version,
            },
            Operation::Insert {
                position: b_pos,
                text: b_text,
                ..
            },
        ) => {
            let position = if *b_pos <= position {
                position + utf16_len(b_text)
            } else {
                position
            };
            Operation::Insert {
                position,
                text,
                base_version,
            }
        }
        (
            Operation::Insert {
                position,
                text,
                base_version,
            },
            Operation::Delete {
                position: b_pos,
                length: b_len,
                ..
            },
        ) => {
            let position = if b_pos.saturating_add(*b_len) <= position {
                position - b_len
            } else if *b_pos < position {
                // Insert fell inside the deleted range.
                *b_pos
            } else {
                position
            };
            Operation::Insert {
                position,
                text,
                base_version,
            }
        }
        (
            Operation::Delete {
                position,
                length,
                base_version,
            },
            Operation::Insert {
                position: b_pos,
                text: b_text,
                ..
            },
        ) => {
            let position = if *b_pos <= position {
                position + utf16_len(b_text)
            } else {
                position
            };
            Operation::Delete {
                position,
                length,
                base_version,
            }
        }
        (
            Operation::Delete {
                position,
                length,
                base_version,
            },
            Operation::Delete {
                position: b_pos,
                length: b_len,
                ..
            },
        ) => {
            let (a_pos, a_len) = (position, length);
            if *b_pos >= a_pos.saturating_add(a_len) {
                Operation::Delete {
                    position: a_pos,
                    length: a_len,
                    base_version,
                }
            } else if b_pos.saturating_add(*b_len) <= a_pos {
                Operation::Delete {
                    position: a_pos - b_len,
                    length: a_len,
                    base_version,
                }
            } else {
                let overlap =
                    (a_pos.saturating_add(a_len)).min(b_pos.saturating_add(*b_len)) - a_pos.max(*b_pos);
                let length = a_len.saturating_sub(overlap);
                if length == 0 {
                    Operation::Noop
                } else {
                    Operation::Delete {
                        position: a_pos.min(*b_pos),
                        length,
                        base_version,
                    }
                }
            }
        }
    }
}

/// Transform the server-accepted `b` to apply after a locally pending `a`.
///
/// Mirror of [`transform`] with the insert tie inverted: on equal insert
/// positions the accepted operation keeps its place, so the pair satisfies
/// `apply(apply(s, a), transform_accepted(b, a)) ==
/// apply(apply(s, b), transform(a, b))` and both sides converge.
pub fn transform_accepted(b: Operation, a: &Operation) -> Operation {
    match (b, a) {
        (b, Operation::Noop) => b,
        (Operation::Noop, _) => Operation::Noop,
        (
            Operation::Insert {
                position,
                text,
                base_version,
            },
            Operation::Insert {
                position: a_pos,
                text: a_text,
                ..
            },
        ) => {
            let position = if *a_pos < position {
                position + utf16_len(a_text)
            } else {
                position
            };
            Operation::Insert {
                position,
                text,
                base_version,
            }
        }
        // The remaining pairings have no tie-break sensitivity and reuse
        // the regular rules.
        (b, a) => transform(b, a),
    }
}

/// Materialize `op` on `content`, clamping out-of-range indices.
pub fn apply(content: &str, op: &Operation) -> String {
    match op {
        Operation::Noop => content.to_string(),
        Operation::Insert { position, text, .. } => {
            let at = byte_index(content, *position);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            out
        }
        Operation::Delete {
            position, length, ..
        } => {
            let start = byte_index(content, *position);
            let end = byte_index(content, position.saturating_add(*length));
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            out
        }
    }
}
