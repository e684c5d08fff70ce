pub mod cart;
pub mod config;
pub mod confirmation;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod service;
pub mod session;
pub mod wal;
