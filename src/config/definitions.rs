//! Instance definitions loaded at startup from a JSON file

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::dispatcher::{Dispatcher, UpsertRequest};
use crate::error::DefinitionsError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyDefinitions {
    #[serde(default)]
    pub instances: Vec<UpsertRequest>,
}

impl StrategyDefinitions {
    pub fn from_json(raw: &str) -> Result<Self, DefinitionsError> {
        Ok(serde_json::from_str(raw)?)
    }
}

pub fn load_definitions(path: &Path) -> Result<StrategyDefinitions, DefinitionsError> {
    let raw = std::fs::read_to_string(path)?;
    StrategyDefinitions::from_json(&raw)
}

/// Upsert every definition. Invalid entries are logged and skipped.
/// Returns how many were applied.
pub async fn apply_definitions(dispatcher: &Arc<Dispatcher>, definitions: StrategyDefinitions) -> usize {
    let mut applied = 0;
    for request in definitions.instances {
        let strategy_id = request.strategy_id.clone();
        let symbol = request.symbol.clone();
        match dispatcher.upsert(request).await {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    warn!(
                        strategy_id = %strategy_id,
                        symbol = %symbol,
                        field = %warning.field,
                        "{}",
                        warning.message
                    );
                }
                applied += 1;
            }
            Err(e) => {
                error!(
                    strategy_id = %strategy_id,
                    symbol = %symbol,
                    error = %e,
                    "Skipping invalid strategy definition"
                );
            }
        }
    }
    info!(applied = applied, "Strategy definitions loaded");
    applied
}
