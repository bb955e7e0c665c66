//! nimbus-client — the client role as a library.
//!
//! [`session::Session`] issues high-level BDD operations by injecting
//! the root operator of a dataflow graph and waiting for its operand
//! reply. [`roots::RootTable`] tracks named functions and their
//! reference counts. [`conjunct`] is the support-similarity
//! conjunction engine, generic over an engine trait so the same code
//! runs distributed and, in tests, against the in-process manager.
//! [`script`] drives a session from a line-oriented command file.

pub mod conjunct;
pub mod roots;
pub mod script;
pub mod session;

pub use session::{ClientError, Session};
