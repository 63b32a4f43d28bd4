//! Table format describing ahead-of-time compiled methods.
//!
//! A code image carries one `.framewalk.info` section next to its text
//! section. The section describes, for every method in the text section, how
//! its frame is laid out, which locations hold GC references at each safe
//! point, and which exception-handling clauses protect which code ranges.
//!
//! The format is produced with [`CodeInfoBuilder`] and consumed in place with
//! [`CodeInfo`], which borrows the section bytes and never allocates. All
//! structural and semantic validation happens once in [`CodeInfo::parse`], so
//! that lookups performed later (possibly from a fault handler or while other
//! threads are suspended) never encounter inconsistent data.

#![deny(missing_docs)]

mod builder;
mod code_info;

pub use crate::builder::*;
pub use crate::code_info::*;
pub use object;

/// Name of the object-file section holding the serialized tables.
pub const ELF_FRAMEWALK_INFO: &str = ".framewalk.info";
