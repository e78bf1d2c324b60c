// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Derivation model: a content-addressed build recipe.

use crate::path::StorePath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A parsed derivation: the inputs, platform and outputs of one build step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivation {
    /// Platform the builder must run on, e.g. `x86_64-linux`.
    pub platform: String,
    /// Path of the builder executable; `builtin:` prefixed builders run
    /// inside the daemon's own store implementation.
    #[serde(default)]
    pub builder: String,
    /// Output name to store path.
    pub outputs: BTreeMap<String, StorePath>,
    /// Input derivations with the output names this derivation consumes.
    #[serde(default)]
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    /// Input sources copied verbatim into the build.
    #[serde(default)]
    pub input_srcs: BTreeSet<StorePath>,
    /// Features a machine must advertise to run this derivation.
    #[serde(default)]
    pub required_system_features: BTreeSet<String>,
    /// Hint that the step is cheap enough to run locally.
    #[serde(default)]
    pub prefer_local_build: bool,
}

impl Derivation {
    /// Whether the builder is a builtin, executed by the store itself
    /// rather than on the derivation's platform.
    pub fn is_builtin(&self) -> bool {
        self.builder.starts_with("builtin:")
    }

    /// The platform used for capability matching. Builtins run wherever
    /// the daemon runs, so they match the local system instead.
    pub fn effective_platform<'a>(&'a self, this_system: &'a str) -> &'a str {
        if self.is_builtin() {
            this_system
        } else {
            &self.platform
        }
    }

    /// The system type string used to partition machines: the platform,
    /// extended with the required features when there are any.
    pub fn system_type(&self, this_system: &str) -> String {
        let platform = self.effective_platform(this_system);
        if self.required_system_features.is_empty() {
            platform.to_string()
        } else {
            let features: Vec<&str> =
                self.required_system_features.iter().map(String::as_str).collect();
            format!("{}:{}", platform, features.join(","))
        }
    }

    /// All output store paths.
    pub fn output_paths(&self) -> BTreeSet<StorePath> {
        self.outputs.values().cloned().collect()
    }
}

#[cfg(test)]
#[path = "derivation_tests.rs"]
mod tests;
