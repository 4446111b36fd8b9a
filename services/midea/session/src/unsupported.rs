//! Tracker for command classes the device never answers.

use std::collections::HashSet;
use tracing::{debug, warn};

/// Command classes skipped until the socket is closed
#[derive(Debug, Default)]
pub struct UnsupportedCommands {
    classes: HashSet<String>,
}

impl UnsupportedCommands {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `class` timed out; returns true the first time
    pub fn mark(&mut self, class: &str) -> bool {
        let inserted = self.classes.insert(class.to_string());
        if inserted {
            warn!("Command {} is not supported", class);
        }
        inserted
    }

    /// Whether `class` is currently skipped
    pub fn contains(&self, class: &str) -> bool {
        self.classes.contains(class)
    }

    /// Number of skipped classes
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether nothing is skipped
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Forget everything (socket closed)
    pub fn clear(&mut self) {
        if !self.classes.is_empty() {
            debug!("Clearing {} unsupported command classes", self.classes.len());
        }
        self.classes.clear();
    }
}
