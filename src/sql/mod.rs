//! SQL Handling
//!
//! Parsing, scope-aware analysis and the read-only guard for generated SQL,
//! all on the `sqlparser` AST.

pub mod analysis;
pub mod guard;

pub use analysis::{parse_query, references, Resolution, Resolver, Unresolved};
pub use guard::{check_read_only, GuardViolation, WRITE_OPERATION_FORBIDDEN};
