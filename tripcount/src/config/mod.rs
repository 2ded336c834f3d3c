//! Analysis configuration
//!
//! Read from a TOML file passed to `tripcount analyze --config`:
//!
//! ```toml
//! max_iterations_to_track = 1000   # brute-force simulation cap
//! simplify_outer_context = true    # use enclosing loops and guards
//! brute_force_fallback = true      # simulate when no closed form exists
//! ```

use crate::error::{NiterError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Knobs of the trip-count engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NiterConfig {
    /// Largest iteration count the brute-force evaluator proves
    #[serde(default = "default_max_iterations")]
    pub max_iterations_to_track: u64,

    /// Simplify results with enclosing-loop evolutions and dominating guards
    #[serde(default = "default_true")]
    pub simplify_outer_context: bool,

    /// Fall back to simulation in `estimate_numbers_of_iterations`
    #[serde(default = "default_true")]
    pub brute_force_fallback: bool,
}

pub const MAX_ITERATIONS_TO_TRACK: u64 = 1000;

const fn default_max_iterations() -> u64 {
    MAX_ITERATIONS_TO_TRACK
}

const fn default_true() -> bool {
    true
}

impl Default for NiterConfig {
    fn default() -> Self {
        Self {
            max_iterations_to_track: default_max_iterations(),
            simplify_outer_context: true,
            brute_force_fallback: true,
        }
    }
}

impl NiterConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| NiterError::config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| NiterError::io_error(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }
}
