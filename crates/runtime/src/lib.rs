//! Runtime glue: the bounded recall-answer loop, the `ask` and `chat`
//! orchestrators, chat history persistence, and the MCP server core with
//! its middleware stack.

mod ask;
mod chat;
mod controller;
pub mod history;
mod protocol;
pub mod server;
mod trace;

pub use ask::{AskOptions, AskOutcome, ask};
pub use chat::{ChatOptions, ChatSession, chat_turn};
pub use controller::{LoopConfig, LoopOutcome, parse_trace, replay, run_loop};
pub use protocol::{Directive, LoopProtocol, parse_reply};
pub use trace::{StopCondition, TraceRecord};
