//! Register-level RSX command processor.
//!
//! Reproduces the behavior of the fixed hardware context bank driven by
//! the GCM command stream: latched register state, deferred effects
//! during an in-progress draw, and the fence/semaphore handshakes other
//! execution contexts rely on. Rasterization itself lives behind the
//! [`backend::RenderBackend`] boundary; this crate's job stops at "what
//! register state changed, what must the backend be told, and in what
//! order".

pub mod backend;
pub mod barrier;
pub mod clause;
pub mod fifo;
pub mod methods;
pub mod regs;
pub mod sync;
pub mod thread;

pub use clause::DrawClause;
pub use fifo::{CommandControl, FifoCounters, FifoState};
pub use regs::RegisterFile;
pub use thread::CommandProcessor;
