//! Lease engine: reservation management and expiry sweeping

pub mod manager;
pub mod reaper;

pub use manager::{ReservationManager, ReservationManagerConfig};
pub use reaper::{ExpiryReaper, ExpiryReaperConfig};
