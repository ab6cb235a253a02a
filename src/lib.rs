pub mod api;
pub mod app;
pub mod automation;
pub mod bots;
pub mod calendar;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod global;
pub mod meeting;
pub mod queue;
pub mod reconcile;
pub mod scheduler;
pub mod transcript;
pub mod urls;
