//! Builder SSH gateway: configuration, supervision and the HTTP health probe

pub mod config;
pub mod health;
pub mod hook;
pub mod supervisor;
