//! Credit Service - prepaid cloud credit ledger with usage reconciliation.

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;
pub mod workers;
