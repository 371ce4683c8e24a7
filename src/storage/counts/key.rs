use std::cmp::Ordering;
use std::fmt;

use crate::primitives::bytes::ord;
use crate::types::{CountsError, Result};

/// Token id matching nodes or relationship endpoints with any label.
pub const ANY_LABEL: i32 = -1;
/// Token id matching relationships of any type.
pub const ANY_RELATIONSHIP_TYPE: i32 = -1;

/// Width of an encoded key in bytes.
pub const KEY_LEN: usize = 13;

const TAG_NODE: u8 = 1;
const TAG_RELATIONSHIP: u8 = 2;

/// Encoded, byte-comparable form of a [`CountsKey`].
pub type EncodedKey = [u8; KEY_LEN];

/// Key of a single count.
///
/// Ordering is structural: node keys sort before relationship keys, then fields in
/// declared order compare as signed integers, so the `-1` sentinels sort before all
/// real token ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CountsKey {
    /// Number of nodes carrying `label`.
    Node {
        /// Label token id or [`ANY_LABEL`].
        label: i32,
    },
    /// Number of relationships `(start)-[rel_type]->(end)`.
    Relationship {
        /// Start node label or [`ANY_LABEL`].
        start: i32,
        /// Relationship type or [`ANY_RELATIONSHIP_TYPE`].
        rel_type: i32,
        /// End node label or [`ANY_LABEL`].
        end: i32,
    },
}

impl CountsKey {
    /// Key counting nodes with `label`.
    pub const fn node(label: i32) -> Self {
        CountsKey::Node { label }
    }

    /// Key counting relationships of `rel_type` between the two labels.
    pub const fn relationship(start: i32, rel_type: i32, end: i32) -> Self {
        CountsKey::Relationship {
            start,
            rel_type,
            end,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            CountsKey::Node { .. } => TAG_NODE,
            CountsKey::Relationship { .. } => TAG_RELATIONSHIP,
        }
    }
}

/// Shorthand for [`CountsKey::node`].
pub const fn node_key(label: i32) -> CountsKey {
    CountsKey::node(label)
}

/// Shorthand for [`CountsKey::relationship`].
pub const fn relationship_key(start: i32, rel_type: i32, end: i32) -> CountsKey {
    CountsKey::relationship(start, rel_type, end)
}

impl fmt::Display for CountsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (first, second) = match *self {
            CountsKey::Node { label } => (i64::from(label), 0),
            CountsKey::Relationship {
                start,
                rel_type,
                end,
            } => ((i64::from(start) << 32) | i64::from(rel_type as u32), end),
        };
        write!(
            f,
            "CountsKey[type:{}, first:{}, second:{}]",
            self.tag(),
            first,
            second
        )
    }
}

/// Binary layout of counts keys in the persisted index.
///
/// `[tag][i32][i32][i32]`, every field big-endian with the sign bit flipped, so
/// comparing encoded keys byte-wise gives the same order as [`CountsKey`]'s `Ord`.
#[derive(Copy, Clone, Debug, Default)]
pub struct KeyLayout;

impl KeyLayout {
    /// Encodes `key` into its fixed-width representation.
    pub fn encode(&self, key: &CountsKey) -> EncodedKey {
        let mut out = [0u8; KEY_LEN];
        out[0] = key.tag();
        match *key {
            CountsKey::Node { label } => {
                ord::put_i32_be(&mut out[1..5], label);
            }
            CountsKey::Relationship {
                start,
                rel_type,
                end,
            } => {
                ord::put_i32_be(&mut out[1..5], start);
                ord::put_i32_be(&mut out[5..9], rel_type);
                ord::put_i32_be(&mut out[9..13], end);
            }
        }
        out
    }

    /// Decodes an encoded key, rejecting unknown tags and dirty padding.
    pub fn decode(&self, bytes: &[u8]) -> Result<CountsKey> {
        if bytes.len() != KEY_LEN {
            return Err(CountsError::Corruption("counts key has wrong length"));
        }
        match bytes[0] {
            TAG_NODE => {
                if bytes[5..].iter().any(|b| *b != 0) {
                    return Err(CountsError::Corruption("node key padding not zero"));
                }
                Ok(CountsKey::node(ord::get_i32_be(&bytes[1..5])))
            }
            TAG_RELATIONSHIP => Ok(CountsKey::relationship(
                ord::get_i32_be(&bytes[1..5]),
                ord::get_i32_be(&bytes[5..9]),
                ord::get_i32_be(&bytes[9..13]),
            )),
            _ => Err(CountsError::Corruption("unknown counts key tag")),
        }
    }

    /// Compares two keys in index order.
    pub fn compare(&self, a: &CountsKey, b: &CountsKey) -> Ordering {
        a.cmp(b)
    }

    /// Compares two encoded keys in index order.
    pub fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}
