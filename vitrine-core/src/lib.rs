pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod ipc;
pub mod models;
pub mod paths;
pub mod screens;
