pub mod api;
pub mod backend;
pub mod config;
pub mod events;
pub mod humanize;
pub mod jobs;
pub mod observability;
pub mod orchestrator;
pub mod store;
