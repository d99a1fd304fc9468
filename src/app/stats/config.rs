use serde::Deserialize;

use crate::app::error::StatsError;

/// Tunables for the weighted rolling statistics store (§4.E, §6).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub max_results: usize,
    pub weight_of_current_result: f32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            max_results: 5,
            weight_of_current_result: 0.75,
        }
    }
}

impl StatsConfig {
    pub fn validate(&self) -> Result<(), StatsError> {
        if self.max_results == 0 {
            return Err(StatsError::ConfigInvalid("max_results must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.weight_of_current_result) {
            return Err(StatsError::ConfigInvalid(
                "weight_of_current_result must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_max_results() {
        let cfg = StatsConfig {
            max_results: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_weight_out_of_range() {
        let cfg = StatsConfig {
            weight_of_current_result: 1.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
