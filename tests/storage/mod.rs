//! Shared storage integration tests.
//!
//! Tests the UserRepository interface against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod user_repository_tests;
