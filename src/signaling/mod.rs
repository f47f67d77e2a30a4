pub mod message;
/// Per connection join, dispatch and teardown.
pub mod session;
pub mod writer;
