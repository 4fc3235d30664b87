//! Load test run orchestrator library.
//!
//! Dispatches load tests to execution engines, tracks the runs each node owns
//! and stops runs wherever in the cluster they execute.

pub mod api;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod db;
pub mod engine;
pub mod entity;
pub mod error;
pub mod jobs;
pub mod migration;
pub mod models;
pub mod services;
pub mod store;
