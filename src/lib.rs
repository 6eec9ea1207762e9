pub mod client;
pub mod core;
pub mod gateway;
pub mod providers;
