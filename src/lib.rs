pub mod auth;
pub mod config;
pub mod error;
pub mod etcd;
pub mod mapping;
pub mod metrics;
pub mod plugin;
pub mod proxy;
pub mod ratelimit;
pub mod server;
pub mod store;
pub mod upstream;
