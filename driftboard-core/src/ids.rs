// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

string_id!(
    /// Identifier of one participating node.
    NodeId
);

string_id!(
    /// Identifier of one shared diagram session.
    RoomId
);

string_id!(
    /// Identifier of a diagram element, threat actor or connection.
    EntityId
);

string_id!(
    /// Globally unique operation identifier.
    ///
    /// The derived lexical `Ord` is load-bearing: concurrent operations with
    /// equal timestamps are resolved by comparing ids, and that comparison
    /// must come out identically on every node.
    OperationId
);

impl OperationId {
    /// Build an operation id from the author and its local operation counter.
    ///
    /// The counter is zero-padded so lexical and numeric order agree for
    /// operations by the same author.
    pub fn from_parts(author: &NodeId, counter: u64) -> Self {
        Self(format!("{counter:016x}@{author}"))
    }
}
