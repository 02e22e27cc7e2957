// Hearth Agent Engine — library root.
//
// Layering: atoms (pure data, no I/O) → engine (behavior) → bin (process
// shell). The binary and the integration tests both build on this crate.

pub mod atoms;
pub mod engine;
