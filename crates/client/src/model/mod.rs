//! Cached entities and the wire records they are built from.
//!
//! Each entity has an explicit `merge` that overwrites only the fields whose
//! incoming value differs and reports whether anything changed. Relations
//! between entities are id sets resolved through the cache.

pub mod flow;
pub mod message;
pub mod organization;
pub mod user;

pub use flow::{Flow, FlowRecord};
pub use message::{Message, MessageKind, MessageRecord, OutboundMessage};
pub use organization::{Organization, OrganizationRecord};
pub use user::{User, UserRecord};

/// Overwrite `slot` with `value` when they differ. Returns true on change.
pub(crate) fn assign<T: PartialEq + Clone>(slot: &mut T, value: &T) -> bool {
    if slot == value {
        return false;
    }
    *slot = value.clone();
    true
}
