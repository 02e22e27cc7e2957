// Hearth atoms layer — pure data types, errors, and constants.
// Rule: no I/O, no side effects, no imports from engine/.

pub mod constants;
pub mod error;
pub mod types;
