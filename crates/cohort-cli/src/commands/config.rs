//! Configuration commands.

use anyhow::{Context, Result};
use cohort_config::CohortConfig;

/// Show the effective configuration after every source is merged.
pub fn show(project_dir: &str, format: &str) -> Result<()> {
    let config =
        CohortConfig::load_from_dir(project_dir).context("Failed to load configuration")?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", config.to_toml_string()?),
        _ => {
            println!("Cohort Configuration");
            println!("====================\n");

            println!("Node:");
            println!("  Identity: {}", config.local_pid());
            println!();

            println!("Group:");
            if config.group.join {
                println!("  Join: waiting for a state transfer");
            } else {
                for member in config.initial_members()? {
                    println!("  Member: {member}");
                }
            }
            println!();

            println!("Transport:");
            println!("  Max frame size: {}", config.transport.max_frame_size);
            println!("  Buffer size: {}", config.transport.buffer_size);
            println!("  No delay: {}", config.transport.nodelay);
            println!();

            println!("FIFO:");
            println!(
                "  Max buffered per source: {}",
                config
                    .fifo
                    .max_buffered_per_source
                    .map_or("unbounded".to_string(), |n| n.to_string())
            );
            println!();

            println!("Causal:");
            println!("  Max outstanding: {}", config.causal.max_outstanding);
            println!("  Early-ack capacity: {}", config.causal.early_ack_capacity);
            println!();

            println!("Runtime:");
            println!(
                "  Command queue capacity: {}",
                config.runtime.command_queue_capacity
            );
            println!("  Poll interval: {}ms", config.runtime.poll_interval_ms);
            println!(
                "  Reconnect interval: {}ms",
                config.runtime.reconnect_interval_ms
            );
        }
    }

    Ok(())
}
