pub mod client;
pub mod extract;

pub use client::{AgentGateway, AgentTurnRequest, GatewayError, HttpAgentClient, NewMessage};
pub use extract::{extract_text, extract_usage};
