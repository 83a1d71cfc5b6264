// warden/src/response/journal.rs
//
// Writes enforcement commands to JSONL instead of touching the host.
// Wire enforcement_commands.jsonl to the enforcement service in production.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{EnforcementError, Enforcer, Target};
use crate::events::ActionType;

const COMMAND_FILE: &str = "enforcement_commands.jsonl";

#[derive(Debug, Serialize)]
struct CommandRecord<'a> {
    action:    ActionType,
    target:    &'a str,
    revert:    bool,
    timestamp: DateTime<Utc>,
}

pub struct JournalEnforcer {
    out: PathBuf,
}

impl JournalEnforcer {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self, EnforcementError> {
        let out: PathBuf = output_dir.into();
        std::fs::create_dir_all(&out)?;
        Ok(Self { out })
    }

    pub fn command_file(&self) -> PathBuf {
        self.out.join(COMMAND_FILE)
    }

    async fn record(&self, action: ActionType, target: &str, revert: bool) -> Result<String, EnforcementError> {
        Target::for_action(action, target)?;
        let rec = CommandRecord { action, target, revert, timestamp: Utc::now() };
        let line = serde_json::to_string(&rec)
            .map_err(|e| EnforcementError::CommandFailed { command: COMMAND_FILE.into(), detail: e.to_string() })?
            + "\n";

        let mut f = OpenOptions::new().create(true).append(true).open(self.command_file()).await?;
        f.write_all(line.as_bytes()).await?;
        info!(action = %action, subject = %target, revert, "enforcement command journaled");
        Ok(format!("journaled to {}", COMMAND_FILE))
    }
}

#[async_trait]
impl Enforcer for JournalEnforcer {
    fn name(&self) -> &str { "journal" }

    async fn apply(&self, action: ActionType, target: &str) -> Result<String, EnforcementError> {
        self.record(action, target, false).await
    }

    async fn revert(&self, action: ActionType, target: &str) -> Result<String, EnforcementError> {
        self.record(action, target, true).await
    }
}
