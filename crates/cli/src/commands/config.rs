// Effective configuration command

use anyhow::Result;
use serde::Serialize;
use taskgate_engine::EngineConfig;

use crate::commands::EngineArgs;
use crate::output::{OutputFormat, Report, Sheet};

#[derive(Serialize)]
struct ConfigReport<'a> {
    #[serde(flatten)]
    config: &'a EngineConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    invalid: Option<String>,
}

impl Report for ConfigReport<'_> {
    fn text(&self, sheet: &mut Sheet) {
        let config = self.config;
        sheet
            .field("Workers", config.workers)
            .field("Queue capacity", config.queue_capacity)
            .field("Rate limit", format!("{}/s", config.rate_limit))
            .field("Rate burst", config.rate_burst)
            .field("Failure threshold", config.failure_threshold)
            .field(
                "Failure window",
                format!("{}ms", config.failure_window.as_millis()),
            )
            .field(
                "Reset timeout",
                format!("{}ms", config.reset_timeout.as_millis()),
            )
            .field("Shutdown mode", config.shutdown_mode);
        if let Some(reason) = &self.invalid {
            sheet.field("Invalid", reason);
        }
    }
}

pub fn run(args: &EngineArgs, output: OutputFormat) -> Result<()> {
    let config = args.resolve();
    let valid = config.validate();

    output.print(&ConfigReport {
        config: &config,
        invalid: valid.as_ref().err().map(ToString::to_string),
    })?;

    valid?;
    Ok(())
}
