//! Configuration for the mesh manager.
//!
//! Configuration is passed to [`MeshManager::new()`](crate::MeshManager::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use lattice_mesh::MeshConfig;
//!
//! let config = MeshConfig {
//!     tag: 7,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

/// Default capacity of the outbound send semaphore.
///
/// Bounds the number of concurrent in-flight sends per manager. All outbound
/// paths (fan-out, bootstrap push, sync queries and replies) take one permit.
pub const DEFAULT_OUTBOUND_PERMITS: usize = 4;

/// The message tag the manager binds under on the cluster transport.
///
/// Multiple components can share one transport by binding distinct tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag(pub u16);

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Configuration for a [`MeshManager`](crate::MeshManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Message tag to bind under on the transport.
    #[serde(default)]
    pub tag: u16,

    /// Capacity of the outbound send semaphore.
    /// Backpressure: callers wait for a free permit before handing bytes
    /// to the transport.
    #[serde(default = "default_outbound_permits")]
    pub outbound_permits: usize,
}

fn default_outbound_permits() -> usize {
    DEFAULT_OUTBOUND_PERMITS
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            tag: 0,
            outbound_permits: DEFAULT_OUTBOUND_PERMITS,
        }
    }
}

impl MeshConfig {
    /// Minimal config for tests.
    pub fn for_testing(tag: u16) -> Self {
        Self {
            tag,
            outbound_permits: DEFAULT_OUTBOUND_PERMITS,
        }
    }

    /// The typed message tag.
    pub fn message_tag(&self) -> Tag {
        Tag(self.tag)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.outbound_permits == 0 {
            return Err("outbound_permits must be at least 1".to_string());
        }
        Ok(())
    }
}
