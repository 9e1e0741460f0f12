//! Control signals emitted by the agent in its textual output.
//!
//! - `<promise>TOKEN</promise>` - the task is done
//! - `<clarification>question</clarification>` - a human must answer
//! - `<permission_request>command</permission_request>` - a blocked command needs approval
//! - a pull/merge request URL - work was published for review
//!
//! The parser is pure; the execution loop decides which signal acts.

mod parser;
mod types;

pub use parser::{SignalParser, extract_pull_request, extract_signals, pr_number};
pub use types::{AgentSignals, PullRequestRef, Signal};
