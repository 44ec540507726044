use std::{fs, path::Path};

use anyhow::Context;
use task_system::TaskSystemConfig;

/// Reads the task system configuration file. Fields missing from the file,
/// or the whole file missing, fall back to the defaults.
pub fn read(path: Option<&Path>) -> anyhow::Result<TaskSystemConfig> {
    let config = match path {
        Some(path) if path.exists() => {
            let config = fs::read_to_string(path)
                .context("Failed to open the task system configuration file")?;
            serde_json::from_str(&config)
                .context("Failed to parse the task system configuration file")?
        }
        Some(path) => {
            tracing::warn!(
                "Task system configuration file {} does not exist, using the defaults",
                path.display(),
            );
            TaskSystemConfig::default()
        }
        None => TaskSystemConfig::default(),
    };
    Ok(config)
}
