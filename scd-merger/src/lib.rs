pub mod app_context;
pub mod config;
pub mod health;
pub mod http;
pub mod metrics_consts;
