pub mod activity;
pub mod catalog;
pub mod config;
pub mod crawl;
pub mod db;
pub mod health;
pub mod model;
pub mod orchestrator;
pub mod server;
