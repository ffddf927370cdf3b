//
// lib.rs
//
// Library crate behind the diagls binary. main.rs only parses arguments
// and calls backend::start_lsp, so integration tests can drive a Session
// directly.
//

pub mod aggregator;
pub mod backend;
pub mod config;
pub mod context;
pub mod diff;
pub mod document_store;
pub mod gateway;
pub mod handlers;
pub mod providers;
pub mod scheduler;
pub mod session;
// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
pub mod utf16;
