//! Lock-free queue primitives for petek.
//!
//! - [`FifoQueue`]: unbounded Michael–Scott FIFO over pool slots with
//!   tagged handles (no hazard pointers needed; the tags defeat ABA).
//! - [`SpscDeque`]: single-producer single-consumer double-ended ring
//!   buffer with a growable backing array.

pub mod fifo;
pub mod spsc;

pub use fifo::FifoQueue;
pub use spsc::SpscDeque;
