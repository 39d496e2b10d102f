//! Target list and routing-mode resolution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The reserved target: always present, always index 0, never removable.
pub const RESERVED_TARGET_URL: &str = "http://localhost:4000";

/// Policy used to pick a target for a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    #[default]
    Active,
    Roundrobin,
    Pattern,
}

/// A routing destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub url: String,
    /// Regular expression matched against request URLs in pattern mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// The mode this target was registered under. Informational.
    #[serde(default)]
    pub mode: RoutingMode,
    #[serde(default)]
    pub protected: bool,
}

impl Target {
    pub fn new(url: impl Into<String>, pattern: Option<String>, mode: RoutingMode) -> Self {
        Self {
            url: url.into(),
            pattern,
            mode,
            protected: false,
        }
    }

    fn reserved() -> Self {
        Self {
            url: RESERVED_TARGET_URL.to_string(),
            pattern: None,
            mode: RoutingMode::Active,
            protected: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("the reserved target cannot be removed")]
    Protected,
    #[error("target index {0} out of bounds")]
    OutOfBounds(usize),
}

/// Ordered target list plus routing state, mutated only through the
/// transition methods below. The owning router persists a snapshot after
/// each mutation.
#[derive(Debug, Clone)]
pub struct TargetList {
    targets: Vec<Target>,
    active_index: usize,
    mode: RoutingMode,
    round_robin_cursor: usize,
}

impl TargetList {
    pub fn new() -> Self {
        Self {
            targets: vec![Target::reserved()],
            active_index: 0,
            mode: RoutingMode::Active,
            round_robin_cursor: 0,
        }
    }

    /// Rebuild from persisted state. The reserved target is reinserted at
    /// index 0 if a stale snapshot lost it, and the active index is clamped
    /// into range. The round-robin cursor is not persisted and starts at 0.
    pub fn from_parts(mut targets: Vec<Target>, active_index: usize, mode: RoutingMode) -> Self {
        if !targets.iter().any(|t| t.protected) {
            targets.insert(0, Target::reserved());
        }
        let active_index = active_index.min(targets.len() - 1);
        Self {
            targets,
            active_index,
            mode,
            round_robin_cursor: 0,
        }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn active_index(&self) -> usize {
        self.active_index
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn add(&mut self, target: Target) {
        self.targets.push(target);
    }

    /// Remove the target at `index`. Protected targets are never removable;
    /// the active index and round-robin cursor shift down with the removal.
    pub fn remove(&mut self, index: usize) -> Result<Target, TargetError> {
        let target = self.targets.get(index).ok_or(TargetError::OutOfBounds(index))?;
        if target.protected {
            return Err(TargetError::Protected);
        }
        let removed = self.targets.remove(index);

        if index < self.active_index {
            self.active_index -= 1;
        }
        self.active_index = self.active_index.min(self.targets.len() - 1);
        self.round_robin_cursor %= self.targets.len();

        Ok(removed)
    }

    pub fn set_active(&mut self, index: usize) -> Result<(), TargetError> {
        if index >= self.targets.len() {
            return Err(TargetError::OutOfBounds(index));
        }
        self.active_index = index;
        Ok(())
    }

    pub fn set_mode(&mut self, mode: RoutingMode) {
        self.mode = mode;
    }

    /// Pick the destination target for a request URL under the current mode.
    ///
    /// Pattern mode is pattern-first, active-fallback: when no pattern
    /// matches (or a pattern fails to compile) selection falls through to
    /// the active target.
    pub fn resolve(&mut self, request_url: &str) -> Option<&Target> {
        match self.mode {
            RoutingMode::Active => self.targets.get(self.active_index),
            RoutingMode::Roundrobin => {
                if self.targets.is_empty() {
                    return None;
                }
                self.round_robin_cursor = (self.round_robin_cursor + 1) % self.targets.len();
                self.targets.get(self.round_robin_cursor)
            }
            RoutingMode::Pattern => {
                let matched = self.targets.iter().position(|t| {
                    t.pattern.as_deref().is_some_and(|p| match regex::Regex::new(p) {
                        Ok(re) => re.is_match(request_url),
                        Err(e) => {
                            tracing::warn!(pattern = %p, error = %e, "invalid target pattern, skipping");
                            false
                        }
                    })
                });
                match matched {
                    Some(index) => self.targets.get(index),
                    None => self.targets.get(self.active_index),
                }
            }
        }
    }
}

impl Default for TargetList {
    fn default() -> Self {
        Self::new()
    }
}
