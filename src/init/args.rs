// SPDX-License-Identifier: Apache-2.0

use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args, Clone)]
pub struct HarvestRun {
    /// JSON configuration file
    #[arg(long, env = "LOGHARVEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Registry file, overrides registry.path of the configuration
    #[arg(long, env = "LOGHARVEST_REGISTRY_PATH")]
    pub registry_path: Option<PathBuf>,

    /// Comma-separated glob patterns harvested by an additional input
    #[arg(long, env = "LOGHARVEST_PATHS", value_delimiter = ',')]
    pub paths: Vec<String>,

    /// ID of the input built from --paths
    #[arg(long, env = "LOGHARVEST_INPUT_ID")]
    pub input_id: Option<String>,

    /// File identity of the input built from --paths
    #[arg(long, env = "LOGHARVEST_FILE_IDENTITY")]
    pub file_identity: Option<String>,

    /// Scan interval of the input built from --paths
    #[arg(
        long,
        env = "LOGHARVEST_CHECK_INTERVAL",
        value_parser = humantime::parse_duration
    )]
    pub check_interval: Option<std::time::Duration>,

    /// Maximum time to wait for inputs and the registry to shut down
    #[arg(
        long,
        env = "LOGHARVEST_SHUTDOWN_TIMEOUT",
        default_value = "5s"
    )]
    pub shutdown_timeout: humantime::Duration,

    /// Events buffered between harvesters and the output
    #[arg(long, env = "LOGHARVEST_OUTPUT_QUEUE_SIZE", default_value = "1000")]
    pub output_queue_size: usize,

    /// Check the configuration and exit
    #[arg(long, env = "LOGHARVEST_TEST_CONFIG", default_value = "false")]
    pub test_config: bool,
}
