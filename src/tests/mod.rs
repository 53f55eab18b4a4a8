//! Cross-subsystem scenario tests driven through fake collaborators.

pub mod support;

mod api_tests;
mod session_tests;
