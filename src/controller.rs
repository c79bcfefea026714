//! Playground controller
//!
//! [`Playground`] turns editor interactions into scene mutations and pin
//! service calls. It is cloned freely across tasks; the scene, the drag
//! tracker and the catalog sit behind short locks that are never held
//! across a network call, so dragging stays responsive while a save or a
//! pin bind is in flight.
//!
//! Every mutation is published as a [`SceneUpdate`] for render surfaces and
//! the live channel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{PinBinding, StateDefaults, WidgetType, WidgetValue};
use crate::config::PlaygroundConfig;
use crate::drag::DragTracker;
use crate::error::{Error, Result};
use crate::gateway::TemplateGateway;
use crate::model::{
    ExportRecord, Position, SavedPin, TemplateDetail, TemplatePayload, VirtualPin, WidgetDefinition,
    WidgetRecord, resolve_widget_ref,
};
use crate::pins::{FetchStatus, PinCapacity, PinClient, PinRange, pick_smallest_free_pin};
use crate::scene::{InstancePatch, Scene, WidgetInstance};

const DEFAULT_MIN: f64 = 0.0;
const DEFAULT_MAX: f64 = 100.0;
const DEFAULT_CURRENT: f64 = 0.0;
const RESET_CURRENT: f64 = 50.0;

/// Where a value change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOrigin {
    Local,
    Remote,
}

/// Scene change notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SceneUpdate {
    Placed { instance: WidgetInstance },
    Moved { instance_id: String, position: Position },
    ValueChanged {
        instance_id: String,
        value: WidgetValue,
        origin: ValueOrigin,
    },
    Configured { instance: WidgetInstance },
    Removed { instance_id: String },
    Reloaded,
}

/// State of the configuration dialog for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDialog {
    pub instance_id: String,
    pub pin_required: u32,
    pub pins: Vec<VirtualPin>,
    pub pin_status: FetchStatus,
    pub selected_pin: Option<String>,
    /// Already-bound pins cannot be changed until the widget is reset
    pub locked: bool,
    pub min_value: f64,
    pub max_value: f64,
    pub current_value: f64,
}

impl ConfigDialog {
    pub fn select_pin(&mut self, pin_id: &str) -> Result<()> {
        if self.locked {
            return Err(Error::PinLocked {
                instance_id: self.instance_id.clone(),
                bound: self.selected_pin.clone().unwrap_or_default(),
            });
        }
        match self.pins.iter().find(|p| p.id == pin_id) {
            Some(pin) if !pin.is_used => {
                self.selected_pin = Some(pin.id.clone());
                Ok(())
            }
            _ => Err(Error::PinInUse {
                pin: pin_id.to_string(),
            }),
        }
    }

    pub fn set_range(&mut self, min_value: f64, max_value: f64) {
        self.min_value = min_value;
        self.max_value = max_value;
    }

    pub fn set_current(&mut self, value: f64) {
        self.current_value = value;
    }

    pub fn capacity(&self) -> PinCapacity {
        PinCapacity::of(&self.pins)
    }
}

/// Outcome of a successful save
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveReport {
    pub saved: usize,
    /// Widgets left out because they need a pin
    pub skipped_missing_pin: usize,
    /// Widgets left out because their catalog id is unknown
    pub dropped_unresolved: usize,
    /// Whether the scene was re-read from the service afterwards
    pub resynced: bool,
}

impl SaveReport {
    /// Non-blocking warning for partially saved scenes
    pub fn warning(&self) -> Option<String> {
        let skipped = self.skipped_missing_pin + self.dropped_unresolved;
        (skipped > 0).then(|| {
            format!(
                "{skipped} widget(s) were not saved: {} need a virtual pin, {} have no widget id",
                self.skipped_missing_pin, self.dropped_unresolved
            )
        })
    }
}

/// Editor state for one template
#[derive(Clone)]
pub struct Playground {
    template_id: String,
    template_name: Arc<Mutex<String>>,
    gateway: Arc<dyn TemplateGateway>,
    pins: PinClient,
    scene: Arc<Mutex<Scene>>,
    catalog: Arc<Mutex<Vec<WidgetDefinition>>>,
    drag: Arc<Mutex<DragTracker>>,
    updates: broadcast::Sender<SceneUpdate>,
    capacity: watch::Sender<PinCapacity>,
}

impl Playground {
    /// Creates an empty playground for `template_id` without any I/O
    pub fn new(config: &PlaygroundConfig, gateway: Arc<dyn TemplateGateway>, template_id: impl Into<String>) -> Self {
        let (updates, _) = broadcast::channel(256);
        let (capacity, _) = watch::channel(PinCapacity::default());
        Self {
            template_id: template_id.into(),
            template_name: Arc::new(Mutex::new(String::new())),
            pins: PinClient::new(gateway.clone()),
            gateway,
            scene: Arc::new(Mutex::new(Scene::new())),
            catalog: Arc::new(Mutex::new(Vec::new())),
            drag: Arc::new(Mutex::new(DragTracker::new(config.drag_cooldown))),
            updates,
            capacity,
        }
    }

    /// Loads the widget catalog and the template's saved scene
    pub async fn open(
        config: &PlaygroundConfig,
        gateway: Arc<dyn TemplateGateway>,
        template_id: impl Into<String>,
    ) -> Result<Self> {
        let playground = Self::new(config, gateway, template_id);
        playground.load_catalog().await?;
        playground.sync().await?;
        Ok(playground)
    }

    /// Creates an empty template on the service and opens it
    pub async fn create(
        config: &PlaygroundConfig,
        gateway: Arc<dyn TemplateGateway>,
        template_name: impl Into<String>,
    ) -> Result<Self> {
        let payload = TemplatePayload {
            template_name: template_name.into(),
            widget_list: Vec::new(),
        };
        let created = gateway.create_template(&payload).await?;
        info!(template_id = %created.id, name = %payload.template_name, "template created");
        Self::open(config, gateway, created.id).await
    }

    pub fn template_id(&self) -> &str {
        &self.template_id
    }

    pub fn template_name(&self) -> String {
        self.template_name.lock().clone()
    }

    pub fn set_template_name(&self, name: impl Into<String>) {
        *self.template_name.lock() = name.into();
    }

    /// Scene change feed
    pub fn subscribe(&self) -> broadcast::Receiver<SceneUpdate> {
        self.updates.subscribe()
    }

    /// Free/total pin counter
    pub fn capacity(&self) -> watch::Receiver<PinCapacity> {
        self.capacity.subscribe()
    }

    pub fn catalog(&self) -> Vec<WidgetDefinition> {
        self.catalog.lock().clone()
    }

    pub fn instances(&self) -> Vec<WidgetInstance> {
        self.scene.lock().iter().cloned().collect()
    }

    pub fn instance(&self, instance_id: &str) -> Option<WidgetInstance> {
        self.scene.lock().get(instance_id).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.scene.lock().is_empty()
    }

    /// Device index of the pin bound to `instance_id`, if known
    pub fn device_pin(&self, instance_id: &str) -> Option<u32> {
        let instance = self.instance(instance_id)?;
        instance
            .device_pin()
            .or_else(|| instance.bound_pin().and_then(|id| self.pins.cached_pin(id)).map(|p| p.pin_id))
    }

    fn publish(&self, update: SceneUpdate) {
        let _ = self.updates.send(update);
    }

    fn publish_capacity(&self) {
        self.capacity.send_replace(self.pins.capacity());
    }

    pub async fn load_catalog(&self) -> Result<usize> {
        let widgets = self.gateway.list_widgets().await?;
        let count = widgets.len();
        *self.catalog.lock() = widgets;
        debug!(count, "widget catalog loaded");
        Ok(count)
    }

    /// Rebuilds the scene from the service's copy of the template
    pub async fn sync(&self) -> Result<()> {
        self.resync(&[]).await
    }

    /// Sync after a save of `saved`; entries the service stores without an
    /// `instance_id` are matched to those records by position.
    async fn resync(&self, saved: &[ExportRecord]) -> Result<()> {
        let detail = self.gateway.fetch_template(&self.template_id).await?;
        self.apply_detail(detail, saved);
        Ok(())
    }

    fn apply_detail(&self, detail: TemplateDetail, saved: &[ExportRecord]) {
        let catalog = self.catalog();
        let pins = detail.virtual_pins;

        {
            let mut scene = self.scene.lock();
            let previous: HashMap<String, WidgetInstance> =
                scene.iter().map(|i| (i.instance_id.clone(), i.clone())).collect();
            scene.clear();

            for (index, entry) in detail.widget_list.into_iter().enumerate() {
                let widget_ref = resolve_widget_ref(&entry.widget_id);
                let widget_id = widget_ref.id().map(str::to_string);
                let definition = catalog
                    .iter()
                    .find(|d| Some(d.id.as_str()) == widget_id.as_deref())
                    .cloned()
                    .or_else(|| embedded_definition(&entry.widget_id))
                    .unwrap_or_else(|| WidgetDefinition::placeholder(widget_id.as_deref()));

                let saved_id = entry.instance_id.filter(|id| !id.trim().is_empty()).or_else(|| {
                    saved
                        .get(index)
                        .filter(|r| Some(r.widget_id.as_str()) == widget_id.as_deref())
                        .map(|r| r.instance_id.clone())
                });
                let survivor = saved_id
                    .as_deref()
                    .filter(|id| scene.get(id).is_none())
                    .and_then(|id| previous.get(id))
                    .filter(|i| i.widget_id == widget_id);

                let binding = entry.pin_config.first().map(|saved_pin| {
                    let device_index = match saved_pin {
                        SavedPin::Pin(pin) => Some(pin.pin_id),
                        SavedPin::Id(id) => pins.iter().find(|p| &p.id == id).map(|p| p.pin_id),
                    };
                    PinBinding::bound(saved_pin.id(), device_index)
                });
                let bound = binding
                    .as_ref()
                    .and_then(PinBinding::pin_id)
                    .and_then(|id| pins.iter().find(|p| p.id == id));

                let mut config = survivor
                    .map(|i| i.config.clone())
                    .unwrap_or_else(|| definition.config_template.clone());
                config.pin_config = binding;
                if let Some(pin) = bound {
                    config.state.min_value = Some(pin.min_value);
                    config.state.max_value = Some(pin.max_value);
                    config.state.current_value = Some(pin.value);
                }

                let id = scene.restore_instance(saved_id.as_deref(), &definition, widget_id, entry.position, config);

                if let Some(survivor) = survivor {
                    scene.update_value(&id, survivor.value.clone());
                } else if let Some(pin) = bound
                    && is_numeric(&definition.kind)
                {
                    scene.update_value(&id, WidgetValue::Number(pin.value));
                }
            }
            info!(template_id = %self.template_id, widgets = scene.len(), "scene loaded");
        }

        *self.template_name.lock() = detail.template_name;
        self.pins.replace(pins);
        self.publish_capacity();
        self.publish(SceneUpdate::Reloaded);
    }

    /// Places a catalog widget; without a position it cascades
    pub fn add_widget(&self, widget_id: &str, position: Option<Position>) -> Result<String> {
        let definition = self
            .catalog
            .lock()
            .iter()
            .find(|d| d.id == widget_id)
            .cloned()
            .ok_or_else(|| Error::UnknownWidget(widget_id.to_string()))?;

        let instance = {
            let mut scene = self.scene.lock();
            let id = scene.add_instance(&definition, position);
            scene.get(&id).cloned()
        };
        let instance = instance.ok_or_else(|| Error::InstanceNotFound(widget_id.to_string()))?;
        let id = instance.instance_id.clone();
        self.publish(SceneUpdate::Placed { instance });
        Ok(id)
    }

    /// Deletes an instance, releasing its pin first. When the release
    /// fails the instance stays on the canvas.
    pub async fn delete(&self, instance_id: &str) -> Result<Option<WidgetInstance>> {
        let Some(snapshot) = self.instance(instance_id) else {
            debug!(instance_id, "delete ignored, instance not found");
            return Ok(None);
        };

        if let Some(pin_id) = snapshot.bound_pin() {
            self.pins.release_pin(pin_id, &self.template_id).await?;
            self.publish_capacity();
        }

        let removed = self.scene.lock().remove_instance(instance_id);
        self.drag.lock().forget(instance_id);
        if removed.is_some() {
            self.publish(SceneUpdate::Removed {
                instance_id: instance_id.to_string(),
            });
        }
        Ok(removed)
    }

    pub fn drag_start(&self, instance_id: &str) -> bool {
        let Some(origin) = self.scene.lock().get(instance_id).map(|i| i.position) else {
            return false;
        };
        self.drag.lock().begin(instance_id, origin, Instant::now());
        true
    }

    /// Applies one drag frame; `(dx, dy)` is the offset since drag start
    pub fn drag_move(&self, instance_id: &str, dx: f64, dy: f64) -> Option<Position> {
        let position = self.drag.lock().drag_to(instance_id, dx, dy, Instant::now())?;
        self.apply_move(instance_id, position)
    }

    pub fn drag_end(&self, instance_id: &str, dx: f64, dy: f64) -> Option<Position> {
        let position = self.drag.lock().end(instance_id, dx, dy, Instant::now())?;
        self.apply_move(instance_id, position)
    }

    fn apply_move(&self, instance_id: &str, position: Position) -> Option<Position> {
        if !self.scene.lock().move_instance(instance_id, position) {
            return None;
        }
        self.publish(SceneUpdate::Moved {
            instance_id: instance_id.to_string(),
            position,
        });
        Some(position)
    }

    pub fn hover_enabled(&self) -> bool {
        self.drag.lock().hover_enabled(Instant::now())
    }

    /// Opens the configuration dialog unless the click trails a drag
    pub async fn click(&self, instance_id: &str) -> Result<Option<ConfigDialog>> {
        let allowed = self.drag.lock().click_allowed(instance_id, Instant::now());
        if !allowed {
            debug!(instance_id, "click swallowed after drag");
            return Ok(None);
        }
        self.open_config(instance_id).await.map(Some)
    }

    /// Value change made by the user; forwarded to the live channel
    pub fn set_value(&self, instance_id: &str, value: WidgetValue) -> bool {
        self.apply_value(instance_id, value, ValueOrigin::Local)
    }

    /// Value change received from the device side
    pub fn apply_remote_value(&self, instance_id: &str, value: WidgetValue) -> bool {
        self.apply_value(instance_id, value, ValueOrigin::Remote)
    }

    fn apply_value(&self, instance_id: &str, value: WidgetValue, origin: ValueOrigin) -> bool {
        if !self.scene.lock().update_value(instance_id, value.clone()) {
            debug!(instance_id, ?origin, "value update for unknown instance ignored");
            return false;
        }
        self.publish(SceneUpdate::ValueChanged {
            instance_id: instance_id.to_string(),
            value,
            origin,
        });
        true
    }

    pub async fn open_config(&self, instance_id: &str) -> Result<ConfigDialog> {
        let instance = self
            .instance(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;

        let listing = self.pins.list_pins(&self.template_id).await;
        if listing.is_loaded() {
            self.publish_capacity();
        }

        let (selected_pin, locked) = match instance.bound_pin() {
            Some(bound) => (Some(bound.to_string()), true),
            None => (pick_smallest_free_pin(&listing.pins).map(|p| p.id.clone()), false),
        };
        let state = &instance.config.state;

        Ok(ConfigDialog {
            instance_id: instance.instance_id.clone(),
            pin_required: instance.pin_required,
            pins: listing.pins,
            pin_status: listing.status,
            selected_pin,
            locked,
            min_value: state.min_value.unwrap_or(DEFAULT_MIN),
            max_value: state.max_value.unwrap_or(DEFAULT_MAX),
            current_value: state.current_value.unwrap_or(DEFAULT_CURRENT),
        })
    }

    /// Binds the dialog's pin and merges the result into the scene
    pub async fn save_config(&self, dialog: &ConfigDialog) -> Result<WidgetInstance> {
        let instance = self
            .instance(&dialog.instance_id)
            .ok_or_else(|| Error::InstanceNotFound(dialog.instance_id.clone()))?;
        let instance_id = instance.instance_id.as_str();

        let requested = dialog.selected_pin.as_deref().filter(|p| !p.trim().is_empty());
        let bound = instance.bound_pin();
        let selected = match (bound, requested) {
            (Some(bound), Some(requested)) if bound != requested => {
                return Err(Error::PinLocked {
                    instance_id: instance_id.to_string(),
                    bound: bound.to_string(),
                });
            }
            (Some(bound), _) => Some(bound),
            (None, requested) => requested,
        };

        if instance.pin_required > 0 && selected.is_none() {
            return Err(Error::MissingPin {
                instance_id: instance_id.to_string(),
            });
        }

        let state = StateDefaults {
            min_value: Some(dialog.min_value),
            max_value: Some(dialog.max_value),
            current_value: Some(dialog.current_value),
            ..instance.config.state.clone()
        };
        let mut patch = InstancePatch::default().set("state", &state);
        if is_numeric(&instance.kind) {
            patch = patch.value(WidgetValue::Number(dialog.current_value));
        }

        if let Some(pin_id) = selected {
            self.ensure_pin_available(instance_id, pin_id, bound)?;

            let range = PinRange {
                value: dialog.current_value,
                min_value: dialog.min_value,
                max_value: dialog.max_value,
            };
            self.pins.bind_pin(pin_id, &self.template_id, range).await?;
            self.publish_capacity();

            let device_index = self.pins.cached_pin(pin_id).map(|p| p.pin_id);
            patch = patch.set("pinConfig", PinBinding::bound(pin_id, device_index));
        }

        let applied = self.scene.lock().update_config(instance_id, patch.clone());
        if !applied {
            warn!(instance_id, "instance vanished while its configuration was saved");
            if let Some(pin_id) = selected
                && bound.is_none()
                && let Err(err) = self.pins.release_pin(pin_id, &self.template_id).await
            {
                warn!(instance_id, pin_id, error = %err, "failed to release orphaned pin");
            }
            return Err(Error::InstanceNotFound(instance_id.to_string()));
        }

        let updated = self
            .instance(instance_id)
            .ok_or_else(|| Error::InstanceNotFound(instance_id.to_string()))?;
        info!(instance_id, pin = ?updated.bound_pin(), "widget configured");
        if let Some(value) = patch.value {
            self.publish(SceneUpdate::ValueChanged {
                instance_id: instance_id.to_string(),
                value,
                origin: ValueOrigin::Local,
            });
        }
        self.publish(SceneUpdate::Configured {
            instance: updated.clone(),
        });
        Ok(updated)
    }

    fn ensure_pin_available(&self, instance_id: &str, pin_id: &str, bound: Option<&str>) -> Result<()> {
        let holder = self.scene.lock().pin_holder(pin_id).map(str::to_string);
        if holder.is_some_and(|h| h != instance_id) {
            return Err(Error::PinInUse {
                pin: pin_id.to_string(),
            });
        }
        let used_elsewhere = self.pins.cached_pin(pin_id).is_some_and(|p| p.is_used) && bound != Some(pin_id);
        if used_elsewhere {
            return Err(Error::PinInUse {
                pin: pin_id.to_string(),
            });
        }
        Ok(())
    }

    /// Clears the range and the pin binding, releasing the pin on the
    /// service. The dialog is refreshed with the authoritative pin set and
    /// pre-selects the smallest free pin.
    pub async fn reset_config(&self, dialog: &mut ConfigDialog) -> Result<()> {
        let instance = self
            .instance(&dialog.instance_id)
            .ok_or_else(|| Error::InstanceNotFound(dialog.instance_id.clone()))?;
        let instance_id = instance.instance_id.as_str();

        if let Some(pin_id) = instance.bound_pin() {
            dialog.pins = self.pins.release_pin(pin_id, &self.template_id).await?;
            dialog.pin_status = FetchStatus::Loaded;
        }

        let state = StateDefaults {
            min_value: Some(DEFAULT_MIN),
            max_value: Some(DEFAULT_MAX),
            current_value: Some(RESET_CURRENT),
            ..instance.config.state.clone()
        };
        let patch = InstancePatch::default().set("state", &state).remove("pinConfig");
        self.scene.lock().update_config(instance_id, patch);

        dialog.set_range(DEFAULT_MIN, DEFAULT_MAX);
        dialog.set_current(RESET_CURRENT);
        dialog.locked = false;
        dialog.selected_pin = pick_smallest_free_pin(&dialog.pins).map(|p| p.id.clone());

        self.publish_capacity();
        if let Some(instance) = self.instance(instance_id) {
            self.publish(SceneUpdate::Configured { instance });
        }
        Ok(())
    }

    /// Saves the scene to the template service.
    ///
    /// Widgets that need a pin and have none are skipped with a warning;
    /// if that leaves nothing while widgets are placed the save is refused.
    pub async fn save(&self) -> Result<SaveReport> {
        let (export, placed, revision) = {
            let scene = self.scene.lock();
            (scene.export_snapshot(), scene.len(), scene.revision())
        };

        if !export.missing_pin.is_empty() {
            warn!(skipped = export.missing_pin.len(), "widgets without a required pin left out of save");
        }
        if placed > 0 && export.records.is_empty() {
            return Err(Error::NothingToSave {
                skipped: export.excluded(),
            });
        }

        let payload = TemplatePayload {
            template_name: self.template_name(),
            widget_list: export.records,
        };
        self.gateway.update_template(&self.template_id, &payload).await?;
        info!(template_id = %self.template_id, widgets = payload.widget_list.len(), "template saved");

        let changed = self.scene.lock().revision() != revision;
        let resynced = if changed {
            debug!("scene changed during save, skipping resync");
            false
        } else {
            match self.resync(&payload.widget_list).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "resync after save failed");
                    false
                }
            }
        };

        Ok(SaveReport {
            saved: payload.widget_list.len(),
            skipped_missing_pin: export.missing_pin.len(),
            dropped_unresolved: export.unresolved.len(),
            resynced,
        })
    }
}

fn is_numeric(kind: &WidgetType) -> bool {
    matches!(kind, WidgetType::Slider | WidgetType::Gauge | WidgetType::NumberInput)
}

/// Definition embedded in a populated `widget_id` object
fn embedded_definition(raw: &serde_json::Value) -> Option<WidgetDefinition> {
    let obj = raw.as_object()?;
    if !obj.contains_key("name") && !obj.contains_key("configuration") {
        return None;
    }
    serde_json::from_value::<WidgetRecord>(raw.clone())
        .ok()
        .map(WidgetDefinition::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGateway, definition, pin};
    use std::time::Duration;

    fn catalog() -> Vec<WidgetDefinition> {
        vec![
            definition("sw", "switch", 0),
            definition("gauge", "3d_gauge", 1),
            definition("slider", "slider", 1),
        ]
    }

    async fn playground(gateway: Arc<FakeGateway>) -> Playground {
        let config = PlaygroundConfig::default();
        Playground::open(&config, gateway, "t1").await.unwrap()
    }

    #[tokio::test]
    async fn test_add_move_save_scenario() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway.clone()).await;

        let id = pg.add_widget("sw", None).unwrap();
        assert_eq!(pg.instance(&id).unwrap().position, Position::new(100.0, 100.0));

        assert!(pg.drag_start(&id));
        pg.drag_move(&id, 100.0, 60.0);
        assert_eq!(pg.drag_end(&id, 240.0, 120.0), Some(Position::new(340.0, 220.0)));

        let report = pg.save().await.unwrap();
        assert_eq!(report.saved, 1);
        assert!(report.warning().is_none());
        assert!(report.resynced);

        let saved = gateway.saved();
        assert_eq!(saved.len(), 1);
        let record = &saved[0].widget_list[0];
        assert_eq!(record.widget_id, "sw");
        assert_eq!(record.position, Position::new(340.0, 220.0));
        assert!(record.pin_config.is_empty());

        // resync kept the instance id
        assert_eq!(pg.instance(&id).unwrap().position, Position::new(340.0, 220.0));
    }

    #[tokio::test]
    async fn test_save_refused_when_nothing_exportable() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway.clone()).await;
        pg.add_widget("gauge", None).unwrap();

        let err = pg.save().await.unwrap_err();
        assert!(matches!(err, Error::NothingToSave { skipped: 1 }));
        assert!(err.is_validation());
        assert!(gateway.saved().is_empty());
    }

    #[tokio::test]
    async fn test_save_partial_reports_skipped() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway.clone()).await;
        pg.add_widget("sw", None).unwrap();
        pg.add_widget("gauge", None).unwrap();

        let report = pg.save().await.unwrap();
        assert_eq!(report.saved, 1);
        assert_eq!(report.skipped_missing_pin, 1);
        assert!(report.warning().unwrap().contains("1 need a virtual pin"));
    }

    #[tokio::test]
    async fn test_save_surfaces_server_error_and_keeps_scene() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("sw", None).unwrap();

        gateway.fail_next(Error::Server {
            status: 409,
            message: "template locked".into(),
        });
        let err = pg.save().await.unwrap_err();
        assert!(matches!(err, Error::Server { ref message, .. } if message == "template locked"));
        assert!(pg.instance(&id).is_some());
    }

    #[tokio::test]
    async fn test_configure_preselects_lowest_pin_and_binds() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p2", 2, false), pin("p1", 1, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();

        let dialog = pg.open_config(&id).await.unwrap();
        assert_eq!(dialog.selected_pin.as_deref(), Some("p1"));
        assert!(!dialog.locked);
        assert_eq!((dialog.min_value, dialog.max_value, dialog.current_value), (0.0, 100.0, 0.0));

        let updated = pg.save_config(&dialog).await.unwrap();
        assert_eq!(updated.bound_pin(), Some("p1"));
        assert_eq!(updated.device_pin(), Some(1));
        assert_eq!(gateway.pin_updates()[0].0, "p1");
        assert_eq!(*pg.capacity().borrow(), PinCapacity { free: 1, total: 2 });

        let reopened = pg.open_config(&id).await.unwrap();
        assert!(reopened.locked);
        assert_eq!(reopened.selected_pin.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_save_config_without_pin_is_rejected() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("slider", None).unwrap();

        let dialog = pg.open_config(&id).await.unwrap();
        assert!(dialog.selected_pin.is_none());
        let err = pg.save_config(&dialog).await.unwrap_err();
        assert!(matches!(err, Error::MissingPin { .. }));
        assert!(gateway.pin_updates().is_empty());
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_instance_unbound() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();

        let dialog = pg.open_config(&id).await.unwrap();
        gateway.fail_next(Error::Network("offline".into()));
        assert!(pg.save_config(&dialog).await.is_err());
        assert!(pg.instance(&id).unwrap().bound_pin().is_none());
    }

    #[tokio::test]
    async fn test_pin_never_double_bound() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false), pin("p2", 2, false)]);
        let pg = playground(gateway.clone()).await;
        let a = pg.add_widget("gauge", None).unwrap();
        let b = pg.add_widget("gauge", None).unwrap();

        let dialog_a = pg.open_config(&a).await.unwrap();
        let mut dialog_b = pg.open_config(&b).await.unwrap();
        assert_eq!(dialog_b.selected_pin.as_deref(), Some("p1"));
        pg.save_config(&dialog_a).await.unwrap();

        let err = pg.save_config(&dialog_b).await.unwrap_err();
        assert!(matches!(err, Error::PinInUse { ref pin } if pin == "p1"));

        dialog_b.selected_pin = Some("p2".into());
        assert_eq!(pg.save_config(&dialog_b).await.unwrap().bound_pin(), Some("p2"));
    }

    #[tokio::test]
    async fn test_locked_dialog_rejects_other_pin() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false), pin("p2", 2, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();
        pg.save_config(&pg.open_config(&id).await.unwrap()).await.unwrap();

        let mut dialog = pg.open_config(&id).await.unwrap();
        assert!(matches!(dialog.select_pin("p2"), Err(Error::PinLocked { .. })));

        dialog.selected_pin = Some("p2".into());
        assert!(matches!(pg.save_config(&dialog).await, Err(Error::PinLocked { .. })));

        // re-saving the bound pin just updates its range
        dialog.selected_pin = Some("p1".into());
        dialog.set_range(10.0, 20.0);
        let updated = pg.save_config(&dialog).await.unwrap();
        assert_eq!(updated.config.state.max_value, Some(20.0));
        assert_eq!(gateway.pin_updates().last().unwrap().1.max_value, 20.0);
    }

    #[tokio::test]
    async fn test_reset_releases_and_reselects() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false), pin("p2", 2, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();

        let mut dialog = pg.open_config(&id).await.unwrap();
        dialog.select_pin("p2").unwrap();
        pg.save_config(&dialog).await.unwrap();

        let mut dialog = pg.open_config(&id).await.unwrap();
        pg.reset_config(&mut dialog).await.unwrap();

        assert_eq!(gateway.deleted_pins(), vec!["p2".to_string()]);
        assert!(!dialog.locked);
        assert_eq!(dialog.selected_pin.as_deref(), Some("p1"));
        assert_eq!((dialog.min_value, dialog.max_value, dialog.current_value), (0.0, 100.0, 50.0));
        assert_eq!(dialog.capacity(), PinCapacity { free: 2, total: 2 });

        let instance = pg.instance(&id).unwrap();
        assert!(instance.bound_pin().is_none());
        assert_eq!(instance.config.state.current_value, Some(50.0));
    }

    #[tokio::test]
    async fn test_failed_release_keeps_binding_and_instance() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();
        pg.save_config(&pg.open_config(&id).await.unwrap()).await.unwrap();

        gateway.fail_next(Error::Network("offline".into()));
        let mut dialog = pg.open_config(&id).await.unwrap();
        // the listing above consumed the failure; fail the release itself
        gateway.fail_next(Error::Network("offline".into()));
        assert!(pg.reset_config(&mut dialog).await.is_err());
        assert_eq!(pg.instance(&id).unwrap().bound_pin(), Some("p1"));

        gateway.fail_next(Error::Network("offline".into()));
        assert!(pg.delete(&id).await.is_err());
        assert!(pg.instance(&id).is_some());
    }

    #[tokio::test]
    async fn test_delete_releases_pin() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();
        pg.save_config(&pg.open_config(&id).await.unwrap()).await.unwrap();

        let removed = pg.delete(&id).await.unwrap();
        assert!(removed.is_some());
        assert_eq!(gateway.deleted_pins(), vec!["p1".to_string()]);
        assert!(pg.delete(&id).await.unwrap().is_none());
        assert!(pg.is_empty());
    }

    #[tokio::test]
    async fn test_configured_range_survives_save() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();

        let mut dialog = pg.open_config(&id).await.unwrap();
        dialog.set_range(10.0, 20.0);
        dialog.set_current(15.0);
        pg.save_config(&dialog).await.unwrap();

        assert!(pg.save().await.unwrap().resynced);
        let reopened = pg.open_config(&id).await.unwrap();
        assert!(reopened.locked);
        assert_eq!((reopened.min_value, reopened.max_value, reopened.current_value), (10.0, 20.0, 15.0));
        assert_eq!(pg.instance(&id).unwrap().value, WidgetValue::Number(15.0));
    }

    #[tokio::test]
    async fn test_open_reads_range_from_bound_pin() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let mut bound = pin("p2", 2, true);
        (bound.min_value, bound.max_value, bound.value) = (-5.0, 5.0, 1.0);
        gateway.set_pins(vec![bound]);
        gateway.set_widget_list(vec![ExportRecord {
            instance_id: "g1".into(),
            widget_id: "gauge".into(),
            pin_config: vec!["p2".into()],
            position: Position::new(0.0, 0.0),
        }]);
        let pg = playground(gateway.clone()).await;

        let dialog = pg.open_config("g1").await.unwrap();
        assert_eq!((dialog.min_value, dialog.max_value, dialog.current_value), (-5.0, 5.0, 1.0));
    }

    #[tokio::test]
    async fn test_save_keeps_ids_and_values_without_echoed_ids() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false)]);
        gateway.omit_instance_ids();
        let pg = playground(gateway.clone()).await;

        let sw = pg.add_widget("sw", None).unwrap();
        let slider = pg.add_widget("slider", None).unwrap();
        pg.set_value(&sw, WidgetValue::Bool(true));
        let mut dialog = pg.open_config(&slider).await.unwrap();
        dialog.set_current(30.0);
        pg.save_config(&dialog).await.unwrap();
        pg.set_value(&slider, WidgetValue::Number(70.0));

        assert!(pg.save().await.unwrap().resynced);
        let ids: Vec<_> = pg.instances().into_iter().map(|i| i.instance_id).collect();
        assert_eq!(ids, vec![sw.clone(), slider.clone()]);
        assert_eq!(pg.instance(&sw).unwrap().value, WidgetValue::Bool(true));
        assert_eq!(pg.instance(&slider).unwrap().value, WidgetValue::Number(70.0));
        assert_eq!(pg.instance(&slider).unwrap().bound_pin(), Some("p1"));
    }

    #[tokio::test]
    async fn test_delete_completes_when_refresh_after_release_fails() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();
        pg.save_config(&pg.open_config(&id).await.unwrap()).await.unwrap();
        assert_eq!(*pg.capacity().borrow(), PinCapacity { free: 0, total: 1 });

        gateway.fail_call("fetch_template", Error::Network("flaky".into()));
        assert!(pg.delete(&id).await.unwrap().is_some());
        assert!(pg.instance(&id).is_none());
        assert_eq!(gateway.deleted_pins(), vec!["p1".to_string()]);
        assert_eq!(*pg.capacity().borrow(), PinCapacity { free: 1, total: 1 });
    }

    #[tokio::test]
    async fn test_reset_completes_when_refresh_after_release_fails() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        gateway.set_pins(vec![pin("p1", 1, false)]);
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("gauge", None).unwrap();
        pg.save_config(&pg.open_config(&id).await.unwrap()).await.unwrap();

        let mut dialog = pg.open_config(&id).await.unwrap();
        gateway.fail_call("fetch_template", Error::Network("flaky".into()));
        pg.reset_config(&mut dialog).await.unwrap();
        assert!(pg.instance(&id).unwrap().bound_pin().is_none());
        assert_eq!(dialog.selected_pin.as_deref(), Some("p1"));
        assert_eq!(dialog.pin_status, FetchStatus::Loaded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_click_after_drag_is_swallowed() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway.clone()).await;
        let id = pg.add_widget("sw", None).unwrap();

        pg.drag_start(&id);
        assert!(!pg.hover_enabled());
        pg.drag_end(&id, 10.0, 10.0);
        assert!(pg.hover_enabled());
        tokio::time::advance(Duration::from_millis(300)).await;
        assert!(pg.click(&id).await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(700)).await;
        let dialog = pg.click(&id).await.unwrap();
        assert_eq!(dialog.unwrap().instance_id, id);
    }

    #[tokio::test]
    async fn test_remote_update_for_unknown_instance() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway.clone()).await;
        let mut updates = pg.subscribe();

        assert!(!pg.apply_remote_value("ghost", WidgetValue::Bool(true)));
        assert!(pg.is_empty());
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_restores_saved_scene() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let mut bound = pin("p3", 3, true);
        bound.value = 42.0;
        gateway.set_pins(vec![bound]);
        gateway.set_widget_list(vec![
            ExportRecord {
                instance_id: "saved-gauge".into(),
                widget_id: "gauge".into(),
                pin_config: vec!["p3".into()],
                position: Position::new(10.0, 20.0),
            },
            ExportRecord {
                instance_id: "saved-unknown".into(),
                widget_id: "retired-widget".into(),
                pin_config: vec![],
                position: Position::new(0.0, 0.0),
            },
        ]);
        let pg = playground(gateway.clone()).await;

        let gauge = pg.instance("saved-gauge").unwrap();
        assert_eq!(gauge.kind, WidgetType::Gauge);
        assert_eq!(gauge.bound_pin(), Some("p3"));
        assert_eq!(gauge.device_pin(), Some(3));
        assert_eq!(gauge.value, WidgetValue::Number(42.0));
        assert_eq!(pg.template_name(), "Test template");
        assert_eq!(*pg.capacity().borrow(), PinCapacity { free: 0, total: 1 });

        let unknown = pg.instance("saved-unknown").unwrap();
        assert_eq!(unknown.kind, WidgetType::Unknown);
        assert_eq!(unknown.widget_id.as_deref(), Some("retired-widget"));
    }

    #[tokio::test]
    async fn test_create_opens_new_template() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = Playground::create(&PlaygroundConfig::default(), gateway, "Greenhouse")
            .await
            .unwrap();
        assert_eq!(pg.template_id(), "t1");
        assert_eq!(pg.template_name(), "Greenhouse");
        assert!(pg.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_catalog_widget() {
        let gateway = Arc::new(FakeGateway::with_widgets(catalog()));
        let pg = playground(gateway).await;
        assert!(matches!(pg.add_widget("nope", None), Err(Error::UnknownWidget(_))));
    }
}
