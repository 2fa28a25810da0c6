//! Tool-calling agent
//!
//! An iterative loop, separate from the pipeline executor, that lets the model
//! inspect and change the workspace through a small tool surface:
//! - `tools`: the executor behind `read_file`, `write_file`, `list_files`,
//!   `search_retrieve` and `run_command`
//! - `tool_parse`: inline `<tool_call>` blocks for backends without native tools
//! - `history`: token estimate and oldest-first trimming
//! - `react`: the loop itself, synchronous and streaming

pub mod history;
pub mod react;
pub mod tool_parse;
pub mod tools;

pub use history::{trim_history, TokenCounter};
pub use react::{AgentConfig, AgentLoop, AgentOutcome, AgentRequest, ToolMode};
pub use tool_parse::{extract_tool_calls, strip_tool_calls, ToolCallScanner};
pub use tools::{ProposedEdit, ToolExecutor, ToolResult};
