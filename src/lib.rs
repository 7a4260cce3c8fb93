pub mod api;
pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod error;
pub mod holds;
pub mod ledger;
pub mod middleware;
pub mod recharge;
pub mod server;
pub mod sweeper;
