//! Task registry

mod store;

pub use store::{TaskStore, MAX_TASKS};
