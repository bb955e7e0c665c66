//! nimbus-bdd — the ref-based BDD engine.
//!
//! A worker owns one [`mgr::RefMgr`]: a unique table enforcing the
//! negation-edge normal form, an ITE memo cache, and the statistics the
//! flush protocol reports. The [`uop`] module is the shared depth-first
//! framework behind mark/support/density/restrict/equant/shift. The
//! [`ops`] module names the distributed opcodes and their slot layouts;
//! the worker executes them, the client builds them.

pub mod mgr;
pub mod ops;
pub mod refs;
pub mod stats;
pub mod uop;

pub use mgr::{BddError, RefMgr};
pub use refs::{Ref, RefType};
