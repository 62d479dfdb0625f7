pub mod claude;
pub mod instruction;

pub use claude::ClaudeRunner;
