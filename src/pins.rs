//! Virtual pin allocation
//!
//! The template service is authoritative for `is_used`. [`PinClient`] keeps
//! the last listing as a cache and refreshes it after every bind or release.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::gateway::TemplateGateway;
use crate::model::{PinUpdate, VirtualPin};

/// Outcome of a pin listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum FetchStatus {
    Loaded,
    Failed(String),
}

/// Pins of a template, or an empty set with the reason the fetch failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinListing {
    pub pins: Vec<VirtualPin>,
    pub status: FetchStatus,
}

impl PinListing {
    pub fn is_loaded(&self) -> bool {
        self.status == FetchStatus::Loaded
    }
}

/// Numeric range written when binding a pin
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PinRange {
    pub value: f64,
    pub min_value: f64,
    pub max_value: f64,
}

/// Free vs total pins, shown by capacity counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PinCapacity {
    pub free: usize,
    pub total: usize,
}

impl PinCapacity {
    pub fn of(pins: &[VirtualPin]) -> Self {
        Self {
            free: pins.iter().filter(|p| !p.is_used).count(),
            total: pins.len(),
        }
    }
}

/// Free pin with the smallest device index
pub fn pick_smallest_free_pin(pins: &[VirtualPin]) -> Option<&VirtualPin> {
    pins.iter().filter(|p| !p.is_used).min_by_key(|p| p.pin_id)
}

/// Client-side view of a template's virtual pins
#[derive(Clone)]
pub struct PinClient {
    gateway: Arc<dyn TemplateGateway>,
    cache: Arc<Mutex<Vec<VirtualPin>>>,
}

impl PinClient {
    pub fn new(gateway: Arc<dyn TemplateGateway>) -> Self {
        Self {
            gateway,
            cache: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Last known pins
    pub fn cached(&self) -> Vec<VirtualPin> {
        self.cache.lock().clone()
    }

    pub fn cached_pin(&self, pin_id: &str) -> Option<VirtualPin> {
        self.cache.lock().iter().find(|p| p.id == pin_id).cloned()
    }

    pub fn capacity(&self) -> PinCapacity {
        PinCapacity::of(&self.cache.lock())
    }

    /// Replaces the cache with an authoritative listing
    pub fn replace(&self, pins: Vec<VirtualPin>) {
        *self.cache.lock() = pins;
    }

    /// Fetches the template's pins. Never fails; a failed fetch yields an
    /// empty set with [`FetchStatus::Failed`] and leaves the cache intact.
    pub async fn list_pins(&self, template_id: &str) -> PinListing {
        match self.gateway.list_pins(template_id).await {
            Ok(pins) => {
                debug!(template_id, count = pins.len(), "virtual pins loaded");
                self.replace(pins.clone());
                PinListing {
                    pins,
                    status: FetchStatus::Loaded,
                }
            }
            Err(err) => {
                warn!(template_id, error = %err, "failed to load virtual pins");
                PinListing {
                    pins: Vec::new(),
                    status: FetchStatus::Failed(err.to_string()),
                }
            }
        }
    }

    /// Marks a pin as used and stores its range. Binding an already bound
    /// pin updates the range.
    pub async fn bind_pin(&self, pin_id: &str, template_id: &str, range: PinRange) -> Result<()> {
        let known = self.cached_pin(pin_id);
        let pin_index = known.as_ref().map(|p| p.pin_id).unwrap_or_default();
        let update = PinUpdate {
            pin_id: pin_index,
            pin_name: known
                .and_then(|p| p.pin_name)
                .unwrap_or_else(|| format!("V{pin_index}")),
            value: range.value,
            min_value: range.min_value,
            max_value: range.max_value,
            is_used: true,
        };

        self.gateway.update_pin(template_id, pin_id, &update).await?;
        info!(template_id, pin_id, "virtual pin bound");

        self.refresh(template_id).await;
        Ok(())
    }

    /// Frees a pin and returns the updated pin set.
    ///
    /// Fails only when the service refuses the release. If the refresh
    /// afterwards fails, the pin is marked free in the cache and the cached
    /// set is returned.
    pub async fn release_pin(&self, pin_id: &str, template_id: &str) -> Result<Vec<VirtualPin>> {
        self.gateway.delete_pin(template_id, pin_id).await?;
        info!(template_id, pin_id, "virtual pin released");

        match self.gateway.list_pins(template_id).await {
            Ok(pins) => {
                self.replace(pins.clone());
                Ok(pins)
            }
            Err(err) => {
                warn!(template_id, pin_id, error = %err, "pin listing after release failed, using cache");
                let mut cache = self.cache.lock();
                if let Some(pin) = cache.iter_mut().find(|p| p.id == pin_id) {
                    pin.is_used = false;
                }
                Ok(cache.clone())
            }
        }
    }

    async fn refresh(&self, template_id: &str) {
        if let Err(err) = self.gateway.list_pins(template_id).await.map(|pins| self.replace(pins)) {
            warn!(template_id, error = %err, "pin cache refresh failed");
        }
    }
}
