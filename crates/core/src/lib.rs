// crates/core/src/lib.rs
pub mod batch;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod hub;
pub mod job;
pub mod lifecycle;
pub mod manager;
pub mod metrics;
pub mod output;
pub mod progress;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use batch::*;
pub use config::*;
pub use error::*;
pub use executor::*;
pub use history::*;
pub use hub::*;
pub use job::*;
pub use lifecycle::*;
pub use manager::*;
pub use progress::*;
