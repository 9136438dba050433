//! Run command - a group member driven from stdin.
//!
//! Each stdin line is one command:
//!
//! ```text
//! causal <text>            causal multicast to the current view
//! fifo <text>              FIFO multicast to the current view
//! join <pid>               ask the group to add <pid>
//! remove <pid>             ask the group to remove <pid>
//! adeliver add <pid>       feed an agreed membership operation
//! adeliver remove <pid>
//! view                     print the current view
//! quit
//! ```
//!
//! Membership requests are printed as `abcast <op>`. Agreeing on them is up
//! to whoever drives the processes: the same `adeliver` lines must be fed to
//! every member in the same order.

use std::io::{self, BufRead};

use anyhow::{Context, Result, bail};
use cohort::{Destinations, EventHandlers, MembershipOp, ProcessId, Runtime, StackConfig, StackHandle};
use cohort_config::CohortConfig;
use tracing::{info, warn};

/// One parsed stdin line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Causal(String),
    Fifo(String),
    Join(ProcessId),
    Remove(ProcessId),
    Adeliver(MembershipOp),
    View,
    Quit,
}

impl Input {
    /// Parses one line. Blank lines yield `None`.
    fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let input = match word {
            "causal" => Self::Causal(rest.to_string()),
            "fifo" => Self::Fifo(rest.to_string()),
            "join" => Self::Join(parse_pid(rest)?),
            "remove" => Self::Remove(parse_pid(rest)?),
            "adeliver" => {
                let (kind, pid) = rest.split_once(' ').unwrap_or((rest, ""));
                let pid = parse_pid(pid.trim())?;
                match kind {
                    "add" => Self::Adeliver(MembershipOp::Add(pid)),
                    "remove" => Self::Adeliver(MembershipOp::Remove(pid)),
                    other => bail!("expected 'add' or 'remove' after adeliver, got '{other}'"),
                }
            }
            "view" => Self::View,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command '{other}'"),
        };
        Ok(Some(input))
    }
}

fn parse_pid(value: &str) -> Result<ProcessId> {
    if value.is_empty() {
        bail!("expected a process id as host:port:incarnation");
    }
    value
        .parse()
        .with_context(|| format!("invalid process id '{value}'"))
}

/// Applies command-line overrides to the node identity.
///
/// A shared member list plus `--port` is enough to start each node. If the
/// new identity is not listed, the entry naming the configured identity is
/// rewritten to it.
fn apply_overrides(config: &mut CohortConfig, port: Option<u16>, incarnation: Option<u32>) {
    let before = config.local_pid();
    if let Some(port) = port {
        config.node.port = port;
    }
    if let Some(incarnation) = incarnation {
        config.node.incarnation = incarnation;
    }
    let after = config.local_pid();
    let listed = |pid: &ProcessId| {
        config
            .group
            .members
            .iter()
            .any(|m| m.parse::<ProcessId>().is_ok_and(|p| p == *pid))
    };
    if before == after || listed(&after) {
        return;
    }
    for member in &mut config.group.members {
        if member.parse::<ProcessId>().is_ok_and(|pid| pid == before) {
            *member = after.to_string();
        }
    }
}

fn handlers() -> EventHandlers {
    EventHandlers::new()
        .on_causal_delivered(|source, payload| {
            println!("[causal] {source}: {}", String::from_utf8_lossy(&payload));
        })
        .on_fifo_delivered(|source, payload| {
            println!("[fifo] {source}: {}", String::from_utf8_lossy(&payload));
        })
        .on_new_view(|view| println!("[view] {view}"))
        .on_abcast(|op| println!("[abcast] {op}"))
        .on_peer_up(|pid| info!(pid = %pid, "peer up"))
        .on_peer_down(|pid, reason| warn!(pid = %pid, reason = %reason, "peer down"))
}

fn execute(handle: &StackHandle, input: Input) -> Result<()> {
    match input {
        Input::Causal(text) => handle.causal_send(text, Destinations::View)?,
        Input::Fifo(text) => handle.fifo_send(text, Destinations::View)?,
        Input::Join(pid) => handle.join(pid)?,
        Input::Remove(pid) => handle.remove(pid)?,
        Input::Adeliver(op) => handle.adeliver(op)?,
        Input::View => match handle.view()? {
            Some(view) => println!("[view] {view}"),
            None => println!("[view] none yet, waiting for a state transfer"),
        },
        Input::Quit => {}
    }
    Ok(())
}

pub fn run(project_dir: &str, port: Option<u16>, incarnation: Option<u32>) -> Result<()> {
    let mut config =
        CohortConfig::load_from_dir(project_dir).context("Failed to load configuration")?;
    apply_overrides(&mut config, port, incarnation);

    let stack_config = StackConfig::from_config(&config).context("Invalid configuration")?;
    let handle = Runtime::spawn(stack_config, handlers()).context("Failed to start node")?;

    info!(pid = %handle.local_pid(), "node started");
    println!("Cohort node {} is running.", handle.local_pid());
    println!("Type 'quit' or close stdin to stop.");

    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read stdin")?;
        match Input::parse(&line) {
            Ok(Some(Input::Quit)) => break,
            Ok(Some(input)) => {
                if let Err(e) = execute(&handle, input) {
                    eprintln!("error: {e:#}");
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("error: {e:#}"),
        }
        if !handle.is_running() {
            warn!("stack stopped");
            break;
        }
    }

    handle.shutdown();
    println!("Node stopped.");
    Ok(())
}
