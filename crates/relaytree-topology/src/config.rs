//! Topology configuration

use serde::{Deserialize, Serialize};

use relaytree_core::DEFAULT_FANOUT;

/// Tree shape parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Maximum established-or-in-progress child links per peer
    pub fanout: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
        }
    }
}
