//! Ambient configuration for the analysis core, loaded the same way this
//! codebase's lineage loads tool configuration: a struct-of-defaults
//! overlaid with a user-supplied TOML document.

use crate::errors::TrenchResult;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// The [`Heuristics`] the running fixpoint was configured with, published
/// once at startup so that [`crate::tree::TreeConfig`] implementations
/// (which are plain trait methods, not values) can read a runtime-chosen
/// widening height instead of a compile-time constant. Mirrors the
/// publish-once pattern `interning`'s factories use for process-wide state.
static ACTIVE_HEURISTICS: OnceCell<Heuristics> = OnceCell::new();

/// Publish `heuristics` as the active set for this process. Only the first
/// call takes effect, matching the fixpoint's single-configuration-per-run
/// model; later calls are no-ops.
pub fn set_active_heuristics(heuristics: Heuristics) {
    let _ = ACTIVE_HEURISTICS.set(heuristics);
}

/// The active [`Heuristics`], or built-in defaults if none have been
/// published yet (e.g. in unit tests that exercise a tree/lattice in
/// isolation).
pub fn active_heuristics() -> Heuristics {
    ACTIVE_HEURISTICS.get().copied().unwrap_or_default()
}

/// Numeric defaults referenced throughout the fixpoint and tree domain.
///
/// A handful of caps that keep the analysis terminating on pathological
/// inputs.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct Heuristics {
    /// Upper bound applied to every tree widen (§4.1, §6).
    pub max_tree_height_after_widening: usize,

    /// Hop cap when propagating frames across calls (§4.6).
    pub max_source_sink_distance: u32,

    /// Fixpoint sweep cap (§4.6, §6).
    pub max_global_analysis_iteration: u32,

    /// Maximum number of virtual overrides resolved at a single callsite
    /// before the callsite is treated as obscure instead of fanning out.
    pub max_overrides_per_callsite: usize,

    /// Maximum leaves a taint tree may carry before `limit_leaves` kicks in.
    pub max_tree_leaves: usize,
}

impl Default for Heuristics {
    fn default() -> Self {
        Self {
            max_tree_height_after_widening: 4,
            max_source_sink_distance: 10,
            max_global_analysis_iteration: 10,
            max_overrides_per_callsite: 40,
            max_tree_leaves: 150,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct CallGraphConfig {
    /// Whether virtual callsites fan out to all targets.
    pub use_multiple_callee_callgraph: bool,

    /// Suppress per-callsite type specialization when an anonymous class
    /// is passed as an argument.
    pub disable_parameter_type_overrides: bool,

    /// Path to dump the callgraph as JSON, or `None` to skip the dump.
    pub dump_call_graph: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ViaCastConfig {
    /// Emit `via-cast` on every checkcast, bypassing the allow-list.
    pub emit_all_via_cast_features: bool,

    /// Types for which `checkcast` emits a `via-cast` feature.
    pub allow_via_cast_features: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Worker threads for the fixpoint's rayon pool, or `None` to auto-detect.
    pub worker_threads: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Configuration {
    pub heuristics: Heuristics,
    pub call_graph: CallGraphConfig,
    pub via_cast: ViaCastConfig,
    pub performance: PerformanceConfig,
}

impl Configuration {
    /// Load configuration from `path`, overlaying it onto built-in
    /// defaults. A missing file is not an error — the defaults are used
    /// as-is, mirroring how this codebase's lineage treats an absent user
    /// config as "use defaults" rather than a hard failure.
    pub fn load(path: &Path) -> TrenchResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Configuration::default());
        }
        let text = fs::read_to_string(path)?;
        let config: Configuration = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn worker_threads(&self) -> usize {
        self.performance.worker_threads.unwrap_or_else(num_cpus::get)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Configuration::default();
        assert!(cfg.heuristics.max_tree_height_after_widening > 0);
        assert!(cfg.heuristics.max_global_analysis_iteration > 0);
        assert!(!cfg.call_graph.use_multiple_callee_callgraph);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trench.toml");
        let cfg = Configuration::load(&path).unwrap();
        assert_eq!(cfg, Configuration::default());
    }

    #[test]
    fn load_overlays_user_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trench.toml");
        fs::write(
            &path,
            r#"
            [heuristics]
            max_source_sink_distance = 3

            [call_graph]
            use_multiple_callee_callgraph = true
            "#,
        )
        .unwrap();

        let cfg = Configuration::load(&path).unwrap();
        assert_eq!(cfg.heuristics.max_source_sink_distance, 3);
        assert!(cfg.call_graph.use_multiple_callee_callgraph);
        // Untouched sections keep their defaults.
        assert_eq!(
            cfg.heuristics.max_tree_height_after_widening,
            Heuristics::default().max_tree_height_after_widening
        );
    }
}
