pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod integration;
pub mod job;
pub mod output;
pub mod profile;
pub mod state;
