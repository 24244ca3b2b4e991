// Library interface for tickerpulse modules
// This allows tests and the binary to import modules

pub mod gate;
pub mod news;
pub mod record_store;
pub mod refresh;
pub mod sentiment;
pub mod server;
pub mod sink;
pub mod stock;
