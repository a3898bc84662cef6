//! Purpose: Shared library crate behind the `gedis` server binary and its tests.
//! Exports: `api` (package registry, host modules), `core` (pool, interpreter, values, errors), `resp`.
//! Role: Everything except process bootstrap and the network accept loop.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod resp;
