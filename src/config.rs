//! Store configuration

use serde::{Deserialize, Serialize};

/// Configuration for an [`ObjectStore`](crate::ObjectStore).
///
/// The two geometry knobs control how slab capacities grow within a pool:
/// the n-th slab of a pool holds
/// `floor(base_objects_per_slab * growth_factor^n)` objects. A
/// `growth_factor` of 1.0 keeps every slab at `base_objects_per_slab`
/// slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Slot count of the first slab in each pool. Must be >= 1.
    pub base_objects_per_slab: usize,
    /// Reserved knob; not consulted by the allocation path.
    pub growth_exponent: f64,
    /// Capacity multiplier applied per additional slab. Must be >= 1.0.
    pub growth_factor: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_objects_per_slab: 25,
            growth_exponent: 5.0,
            growth_factor: 1.3,
        }
    }
}

impl StoreConfig {
    /// Returns a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }
}
