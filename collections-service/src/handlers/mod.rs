//! HTTP handlers for collections-service.

pub mod admin;
pub mod disputes;
pub mod health;
pub mod invoices;
pub mod rules;
pub mod tracking;
pub mod webhook;

pub use health::{health_check, metrics_endpoint, readiness_check};
