pub mod agent;
pub mod tools;

pub use agent::{AgentError, AgentRequest, AgentResponse, AiProvider, HttpAiProvider, run_agent_loop};
pub use tools::{ToolRegistry, Tool, ToolCall};
