// warden/src/response/mod.rs
//
// Enforcement backends. The policy engine decides; an Enforcer only executes
// (or reverts) one containment action against one target.
//
//   CommandEnforcer  iptables / kill on the local host, or simulation
//   JournalEnforcer  JSONL command stream for an external enforcement service

pub mod command;
pub mod journal;

pub use command::CommandEnforcer;
pub use journal::JournalEnforcer;

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::events::ActionType;

#[derive(Debug, Error)]
pub enum EnforcementError {
    #[error("{0} is not supported by this enforcer")]
    Unsupported(ActionType),
    #[error("{target:?} is not a valid target for {action}")]
    InvalidTarget { action: ActionType, target: String },
    #[error("`{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("enforcement timed out after {0:?}")]
    Timeout(Duration),
}

/// Parsed enforcement target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ip(IpAddr),
    Process { name: String, pid: u32 },
}

impl Target {
    /// Block and isolate need an IP; terminate needs a `name:pid` subject.
    pub fn for_action(action: ActionType, subject: &str) -> Result<Self, EnforcementError> {
        let invalid = || EnforcementError::InvalidTarget { action, target: subject.to_string() };
        match action {
            ActionType::BlockConnection | ActionType::IsolateHost => {
                subject.parse::<IpAddr>().map(Target::Ip).map_err(|_| invalid())
            }
            ActionType::TerminateProcess => {
                let (name, pid) = subject.rsplit_once(':').ok_or_else(invalid)?;
                let pid: u32 = pid.parse().map_err(|_| invalid())?;
                if pid <= 1 {
                    return Err(invalid());
                }
                Ok(Target::Process { name: name.to_string(), pid })
            }
            ActionType::NotifyOnly => Err(EnforcementError::Unsupported(action)),
        }
    }
}

#[async_trait]
pub trait Enforcer: Send + Sync {
    fn name(&self) -> &str;

    /// Apply the action. Ok carries a short description of what was done.
    async fn apply(&self, action: ActionType, target: &str) -> Result<String, EnforcementError>;

    async fn revert(&self, action: ActionType, target: &str) -> Result<String, EnforcementError>;
}
