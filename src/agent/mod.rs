//! Agent process: the client side of the event protocol plus the command
//! worker pool.

mod client;
pub mod config;
mod worker;

pub use config::{load_agent_config, AgentConfig};

use anyhow::Result;

/// Run the agent until it is stopped or reconnecting is exhausted.
pub async fn run(config: AgentConfig) -> Result<()> {
    client::run_agent(config).await
}
