pub mod deploy_time;
pub mod engine;
pub mod gc;
pub mod reconcile;
pub mod task;

pub use deploy_time::*;
pub use engine::*;
pub use gc::*;
pub use reconcile::*;
pub use task::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "updater_test.rs"]
mod tests;
