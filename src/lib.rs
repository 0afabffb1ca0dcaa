pub mod agent;
pub mod analytics;
pub mod batch;
pub mod config;
pub mod dashboard;
pub mod db;
pub mod prom_metrics;
