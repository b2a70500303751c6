pub mod agent;
pub mod browser;
pub mod credentials;
pub mod oracle;
pub mod parse;
pub mod policy;
pub mod recorder;
pub mod recovery;
pub mod resolver;
pub mod types;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use agent::{ActionOutcome, Agent, AgentConfig, AgentError, Computer, Oracle};
pub use browser::{Browser, BrowserConfig, ChromiumComputer};
pub use oracle::{OracleClient, OracleConfig};
pub use policy::{AllowAllPolicy, Criticality, DryRunPolicy};
pub use recorder::{DiskRecorder, NullRecorder, RunRecorder};
pub use types::{Action, ActionKind, Goal, PageState, RunOutcome, RunResult, StepRecord};
