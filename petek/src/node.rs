//! Node base for hazard-managed containers.

use core::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

/// Metadata embedded in every node type handed to a
/// [`HazardMem`](crate::HazardMem).
///
/// Containers declare their node as a struct whose first field is a
/// `HazardNode`, add their own links and payload, and expose the base
/// through [`HazardManaged`].
pub struct HazardNode {
    /// Count of link references across all threads. Approximate: a CAS
    /// publication increments the new target before decrementing the old
    /// one, so the count never transiently touches zero while the node
    /// stays reachable.
    pub(crate) ref_count: AtomicIsize,
    /// Scan witness: set once `ref_count` was observed at zero, cleared
    /// whenever a new reference appears.
    pub(crate) trace: AtomicBool,
    /// Set when the container has logically detached the node.
    pub(crate) del: AtomicBool,
}

impl HazardNode {
    pub const fn new() -> Self {
        Self {
            ref_count: AtomicIsize::new(0),
            trace: AtomicBool::new(false),
            del: AtomicBool::new(false),
        }
    }

    /// Whether the container has logically detached this node.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.del.load(Ordering::SeqCst)
    }
}

impl Default for HazardNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Access to the embedded [`HazardNode`] of a container node type.
pub trait HazardManaged {
    fn hazard_node(&self) -> &HazardNode;
}
