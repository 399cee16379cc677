//! Petek: hazard-pointer memory reclamation for lock-free containers.
//! Bounded memory usage, no stop-the-world phases, no garbage collector.
//!
//! Petek implements hazard pointers combined with per-node reference
//! counting, so containers can unlink nodes while concurrent readers are
//! still traversing them. A node is handed back to its pool only once no
//! link references it, no thread holds a hazard on it, and a scan pass
//! has witnessed that state staying stable.
//!
//! # Key pieces
//!
//! - [`HazardMem`]: the memory manager. Containers go through it for every
//!   link load ([`HazardMem::de_ref_link`]) and publication
//!   ([`HazardMem::cas_ref`] / [`HazardMem::store_ref`]).
//! - [`NodePool`]: slab-backed typed pool with per-slot tag sequences;
//!   freed nodes return to the free list of the thread that allocated them.
//! - [`Link`] / [`TaggedLink`]: the two single-word atomic cell encodings
//!   (pointer + delete mark, and pool index + ABA tag).
//!
//! # Example
//!
//! ```rust
//! use petek::{HazardMem, HazardMemConfig, HazardManaged, HazardNode, Link, LinkVal};
//!
//! struct Cell {
//!     base: HazardNode,
//!     out: Link<Cell>,
//!     value: u64,
//! }
//!
//! impl HazardManaged for Cell {
//!     fn hazard_node(&self) -> &HazardNode {
//!         &self.base
//!     }
//! }
//!
//! struct Cfg;
//!
//! impl HazardMemConfig for Cfg {
//!     type Node = Cell;
//!     const LINK_MAX: usize = 1;
//!     const LINK_DEL_MAX: usize = 1;
//!     const HAZARD_MAX: usize = 4;
//!
//!     fn clean_up_node(&self, _mem: &HazardMem<Self>, _node: *mut Cell) {}
//!     fn terminate_node(&self, mem: &HazardMem<Self>, node: *mut Cell, concurrent: bool) {
//!         let out = unsafe { &(*node).out };
//!         if concurrent {
//!             loop {
//!                 let old = out.load(std::sync::atomic::Ordering::SeqCst);
//!                 if mem.cas_ref(out, LinkVal::null(), old) {
//!                     break;
//!                 }
//!             }
//!         } else {
//!             mem.store_ref(out, LinkVal::null());
//!         }
//!     }
//! }
//!
//! let mem = HazardMem::new(Cfg, 4);
//! let node = mem.create_node(Cell {
//!     base: HazardNode::new(),
//!     out: Link::new(),
//!     value: 42,
//! });
//! assert_eq!(unsafe { (*node).value }, 42);
//! mem.release_ref(node);
//! mem.delete_node(node);
//! ```

mod link;
mod mem;
mod node;
mod pool;
mod registry;
mod ttas;
mod utils;

pub use link::{Link, LinkVal, NIL, TaggedHandle, TaggedLink};
pub use mem::{HazardMem, HazardMemConfig};
pub use node::{HazardManaged, HazardNode};
pub use pool::NodePool;
pub use registry::ThreadRegistry;
pub use ttas::{TTas, TTasGuard};
pub use utils::CacheAligned;
