/// Cluster topology: slot hashing, the slot table and the reload machinery
pub mod slots;
pub mod topology;

pub use slots::{key_to_slot, SlotInfo, SlotTable, SLOT_COUNT};
pub use topology::ReadPreference;

/// A backend's stable identity, in `host:port` form
pub type Endpoint = String;
