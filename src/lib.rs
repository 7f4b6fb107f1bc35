pub mod auth;
pub mod balances;
pub mod calendar;
pub mod categories;
pub mod change_log;
pub mod client;
pub mod config;
pub mod conflicts;
pub mod constants;
pub mod database;
pub mod entries;
pub mod error;
pub mod extract;
pub mod models;
pub mod payment_methods;
pub mod receipts;
pub mod recurrence;
pub mod recurring_rules;
pub mod routes;
pub mod scheduler;
pub mod sync;
pub mod utils;
