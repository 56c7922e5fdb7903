//! A managed runtime core for ECMA-335 assemblies.
//!
//! The crate parses PE images and CLI metadata (`raw`), materializes a
//! lazily built type system over them (`metadata`), and provides the
//! execution services an IL interpreter needs (`vm`): the object model,
//! the evaluation/frame machine, exceptions, internal calls, and
//! custom-attribute decoding. The per-opcode dispatch loop itself is an
//! external collaborator wired in through `vm::settings`.

pub mod context;
pub mod errors;
pub mod metadata;
pub mod raw;
pub mod vm;

pub(crate) mod utilities;

pub use context::Context;
pub use errors::{RtErr, RtResult};
