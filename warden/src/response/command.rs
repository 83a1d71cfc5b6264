// warden/src/response/command.rs
//
// Local enforcement through iptables / ip6tables and kill.
//
//   block-connection   -A INPUT  -s <ip> -j DROP
//   isolate-host       -A INPUT  -s <ip> -j DROP  +  -A OUTPUT -d <ip> -j DROP
//   terminate-process  kill -TERM <pid>            (not revertible)
//
// Reverting replaces -A with -D. In simulation mode the commands are only
// logged.

use std::net::IpAddr;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::{EnforcementError, Enforcer, Target};
use crate::events::ActionType;

pub struct CommandEnforcer {
    simulate: bool,
}

impl CommandEnforcer {
    pub fn new(simulate: bool) -> Self {
        Self { simulate }
    }

    async fn run(&self, action: ActionType, target: &str, revert: bool) -> Result<String, EnforcementError> {
        let commands = commands_for(action, target, revert)?;
        let rendered: Vec<String> = commands.iter().map(|c| c.join(" ")).collect();

        if self.simulate {
            for line in &rendered {
                info!(action = %action, subject = %target, revert, "SIMULATION: {}", line);
            }
            return Ok(format!("simulated: {}", rendered.join(" && ")));
        }

        for (argv, line) in commands.iter().zip(&rendered) {
            let output = exec(argv).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                warn!(action = %action, subject = %target, command = %line, "enforcement command failed");
                return Err(EnforcementError::CommandFailed {
                    command: line.clone(),
                    detail:  if stderr.is_empty() { output.status.to_string() } else { stderr },
                });
            }
            info!(action = %action, subject = %target, revert, command = %line, "enforcement command applied");
        }
        Ok(rendered.join(" && "))
    }
}

#[async_trait]
impl Enforcer for CommandEnforcer {
    fn name(&self) -> &str { "command" }

    async fn apply(&self, action: ActionType, target: &str) -> Result<String, EnforcementError> {
        self.run(action, target, false).await
    }

    async fn revert(&self, action: ActionType, target: &str) -> Result<String, EnforcementError> {
        self.run(action, target, true).await
    }
}

/// Run one command to completion. The child is killed if the future is
/// dropped, so an enforcement timeout never leaves it running.
async fn exec(argv: &[String]) -> std::io::Result<Output> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"))?;
    Command::new(program).args(args).kill_on_drop(true).output().await
}

/// argv lists for one action. Pure, so the exact commands are testable.
pub fn commands_for(action: ActionType, target: &str, revert: bool) -> Result<Vec<Vec<String>>, EnforcementError> {
    let op = if revert { "-D" } else { "-A" };
    let rule = |ip: &IpAddr, chain: &str, dir: &str| -> Vec<String> {
        let bin = if ip.is_ipv6() { "ip6tables" } else { "iptables" };
        vec![bin.into(), op.into(), chain.into(), dir.into(), ip.to_string(), "-j".into(), "DROP".into()]
    };

    match (action, Target::for_action(action, target)?) {
        (ActionType::BlockConnection, Target::Ip(ip)) => Ok(vec![rule(&ip, "INPUT", "-s")]),
        (ActionType::IsolateHost, Target::Ip(ip)) => {
            Ok(vec![rule(&ip, "INPUT", "-s"), rule(&ip, "OUTPUT", "-d")])
        }
        (ActionType::TerminateProcess, Target::Process { pid, .. }) if !revert => {
            Ok(vec![vec!["kill".into(), "-TERM".into(), pid.to_string()]])
        }
        (action, _) => Err(EnforcementError::Unsupported(action)),
    }
}
