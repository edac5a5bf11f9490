//! Deterministic, pure logic for agent invocations.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data (option sets, output buffers, partial results) and return
//! deterministic outputs suitable for tests.

pub mod args;
pub mod cancel;
pub mod error;
pub mod options;
pub mod output;
pub mod progress;
pub mod schema;
pub mod signatures;
pub mod stop;
pub mod stream;
pub mod types;
