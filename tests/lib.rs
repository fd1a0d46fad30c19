//! Test support for mediarelay integration tests
//!
//! Scripted endpoints, a scripted factory and a level-triggered poller that
//! let the relay loop be driven one iteration at a time without sockets.

pub mod fixtures;
