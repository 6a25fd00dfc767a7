pub mod canary;
pub mod clock;
pub mod delay_reason;
pub mod notification;
pub mod registrar;
pub mod release;
pub mod requirements;
pub mod settings;
pub mod step;
pub mod store;
pub mod updater;
pub mod version;

#[cfg(test)]
pub mod test_support;

pub use updater::{error_policy, reconcile, Context, ReconcileError};
