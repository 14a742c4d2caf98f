pub mod reconciler;
pub mod scheduler;

pub use reconciler::{AccountReport, Reconciler, TickReport};
pub use scheduler::ReconciliationScheduler;
