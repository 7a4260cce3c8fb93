pub mod handler;
pub mod models;
pub mod webhook;

pub use handler::AppState;
