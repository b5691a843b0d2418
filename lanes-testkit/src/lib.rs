//! Test collaborators for lanes: in-memory repositories, scripted executors,
//! a recording bus and a harness wiring them to an in-memory transport.

mod harness;
mod mock;
mod repos;

pub use harness::*;
pub use mock::*;
pub use repos::*;
