//! API request handlers

pub mod health;
pub mod lease;
pub mod proxy;
