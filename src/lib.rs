pub mod auth;
pub mod client;
pub mod config;
pub mod conversation;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod state;
pub mod stream;

mod util;
