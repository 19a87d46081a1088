// SPDX-License-Identifier: Apache-2.0

use figment::Figment;
use figment::providers::{Env, Format, Json};
use tower::BoxError;
use tracing::debug;

use crate::config::{Config, IdentityConfig, InputConfig};
use crate::init::args::HarvestRun;

const ENV_PREFIX: &str = "LOGHARVEST_";

/// Load the configuration: the JSON file if given, then `LOGHARVEST_REGISTRY__*`
/// environment variables, then the command line.
pub fn load_config(args: &HarvestRun) -> Result<Config, BoxError> {
    let mut figment = Figment::new();
    if let Some(path) = &args.config {
        if !path.exists() {
            return Err(format!("config file not found: {}", path.display()).into());
        }
        figment = figment.merge(Json::file(path));
    }
    figment = figment.merge(
        Env::prefixed(ENV_PREFIX)
            .filter(|key| key.starts_with("registry"))
            .split("__"),
    );

    let mut config: Config = figment
        .extract()
        .map_err(|e| format!("failed to load configuration: {}", e))?;
    apply_args(&mut config, args);
    debug!(inputs = config.inputs.len(), "Loaded configuration");
    Ok(config)
}

fn apply_args(config: &mut Config, args: &HarvestRun) {
    if let Some(path) = &args.registry_path {
        config.registry.path = path.clone();
    }
    if args.paths.is_empty() {
        return;
    }

    let mut input = InputConfig {
        id: args.input_id.clone(),
        paths: args.paths.clone(),
        ..InputConfig::default()
    };
    if let Some(kind) = &args.file_identity {
        input.file_identity = IdentityConfig {
            kind: kind.clone(),
            ..IdentityConfig::default()
        };
    }
    if let Some(interval) = args.check_interval {
        input.scanner.check_interval_ms = interval.as_millis() as u64;
    }
    config.inputs.push(input);
}
