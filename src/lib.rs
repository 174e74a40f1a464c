pub mod access;
pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notifier;
pub mod routes;
pub mod schema;
pub mod session;
pub mod state;
pub mod storage;
pub mod store;
pub mod users;
pub mod utils;
