//! Integration test crate for the shallot overlay.
//!
//! This crate has no library code; it only contains integration tests
//! that exercise end-to-end flows across multiple workspace crates.
//!
//! Run all integration tests, including the QUIC ones that bind fixed ports:
//! ```sh
//! cargo test -p shallot-integration-tests -- --include-ignored
//! ```
