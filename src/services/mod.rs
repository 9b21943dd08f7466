//! Background services

pub mod geo_classifier;
pub mod health_checker;
pub mod scheduler;

pub use geo_classifier::{GeoClassifier, GeoClassifierConfig};
pub use health_checker::{HealthChecker, HealthCheckerConfig};
pub use scheduler::{BackgroundScheduler, SchedulerConfig};
