//! Command handlers for the Courier CLI

use std::time::Duration;
use tracing::info;

use courier_core::CourierConfig;

use crate::cli::{Cli, Commands};
use crate::error::Result;
use crate::simulate::{Simulation, SimulationReport};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli) -> Result<()> {
        let config = load_configuration(cli.config.as_deref())?;
        match cli.command {
            Commands::CheckConfig { dump } => Self::handle_check_config(&config, dump),
            Commands::Simulate {
                users,
                messages,
                timeout_secs,
                json,
            } => {
                let simulation = Simulation::new(config, users, messages)
                    .with_phase_timeout(Duration::from_secs(timeout_secs));
                Self::handle_simulate(simulation, json).await
            }
        }
    }

    fn handle_check_config(config: &CourierConfig, dump: bool) -> Result<()> {
        println!("{}", config_summary(config));
        if dump {
            println!();
            println!("{}", toml::to_string_pretty(config)?);
        }
        Ok(())
    }

    async fn handle_simulate(simulation: Simulation, json: bool) -> Result<()> {
        let report = simulation.run().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("{}", report_summary(&report));
        }
        Ok(())
    }
}

/// Load configuration from file or use defaults
pub fn load_configuration(path: Option<&str>) -> Result<CourierConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            Ok(CourierConfig::load(path)?)
        }
        None => {
            info!("Using default configuration");
            let config = CourierConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

pub fn config_summary(config: &CourierConfig) -> String {
    let delivery = &config.delivery;
    let platforms: Vec<String> = config
        .platforms
        .iter()
        .map(|p| match p.max_offline_count {
            count if count < 0 => format!("{} (unbounded)", p.name),
            count => format!("{} (max {})", p.name, count),
        })
        .collect();

    [
        "Configuration OK".to_string(),
        format!("  gateway outbound capacity: {}", config.gateway.outbound_capacity),
        format!("  directory topic:           {}", config.directory.topic),
        format!(
            "  delivery topics:           {} / {} / {}",
            delivery.topic, delivery.retry_topic, delivery.dlq_topic
        ),
        format!(
            "  delivery workers:          {} primary, {} retry",
            delivery.concurrency, delivery.retry_concurrency
        ),
        format!(
            "  ack wait / retry delay:    {:?} / {:?} (max {} retries)",
            delivery.ack_wait(),
            delivery.retry_delay(),
            delivery.max_retries
        ),
        format!(
            "  offline:                   expire {:?}, batch {}",
            config.offline.expire(),
            config.offline.batch_count
        ),
        format!("  platforms:                 {}", platforms.join(", ")),
    ]
    .join("\n")
}

pub fn report_summary(report: &SimulationReport) -> String {
    [
        "Simulation complete".to_string(),
        format!(
            "  users:                {} ({} online at push time)",
            report.users, report.online_users
        ),
        format!("  messages per user:    {}", report.messages_per_user),
        format!("  delivered live:       {}", report.delivered_live),
        format!("  stored offline:       {}", report.stored_offline),
        format!("  delivered on connect: {}", report.delivered_from_backlog),
        format!("  retried envelopes:    {}", report.retried),
        format!("  dead-lettered:        {}", report.dead_lettered),
        format!("  elapsed:              {} ms", report.elapsed_ms),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_configuration_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[delivery]
max_retries = 5

[[platforms]]
name = "ios"
max_offline_count = 100
"#
        )
        .unwrap();

        let config = load_configuration(file.path().to_str()).unwrap();
        assert_eq!(config.delivery.max_retries, 5);
        assert_eq!(config.platforms.len(), 1);

        let summary = config_summary(&config);
        assert!(summary.contains("ios (max 100)"));
    }

    #[test]
    fn test_invalid_configuration_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[offline]\nbatch_count = 3\n\n[[platforms]]\nname = \"ios\"\nmax_offline_count = -1"
        )
        .unwrap();
        let err = load_configuration(file.path().to_str()).unwrap_err();
        assert!(err.to_string().contains("batch_count"));
    }

    #[test]
    fn test_default_configuration_summary() {
        let config = load_configuration(None).unwrap();
        let summary = config_summary(&config);
        assert!(summary.contains("web (unbounded)"));
        assert!(toml::to_string_pretty(&config).is_ok());
    }
}
