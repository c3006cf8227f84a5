pub mod cli;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod event;
pub mod handler;
pub mod loader;
pub mod notify;
pub mod retry;
pub mod server;
pub mod storage;
pub mod upgrade;
