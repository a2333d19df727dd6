pub mod config;
pub mod event;
pub mod record;
pub mod relay;
pub mod wire;
