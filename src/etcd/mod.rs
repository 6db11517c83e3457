pub mod client;

pub use client::EtcdClient;
