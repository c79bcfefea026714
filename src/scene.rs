//! In-memory scene of placed widgets
//!
//! The scene owns every [`WidgetInstance`] on the canvas, in placement
//! order. Operations on ids that are no longer present are silent no-ops
//! that report `false`/`None`; nothing here returns an error.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::codec::{self, ConfigDocument, PinBinding, WidgetType, WidgetValue};
use crate::model::{ExportRecord, Position, WidgetDefinition};

/// A widget placed on the canvas
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetInstance {
    pub instance_id: String,
    /// Catalog id, `None` when it could not be resolved
    pub widget_id: Option<String>,
    pub name: String,
    pub kind: WidgetType,
    pub pin_required: u32,
    pub position: Position,
    pub config: ConfigDocument,
    pub value: WidgetValue,
}

impl WidgetInstance {
    pub fn bound_pin(&self) -> Option<&str> {
        self.config.bound_pin()
    }

    /// Device-facing index of the bound pin, when the binding carries one
    pub fn device_pin(&self) -> Option<u32> {
        self.config.pin_config.as_ref().and_then(PinBinding::device_index)
    }

    /// Widgets with `pin_required > 0` need a bound pin to be saved
    pub fn is_exportable(&self) -> bool {
        self.pin_required == 0 || self.bound_pin().is_some()
    }
}

/// Partial update applied by [`Scene::update_config`]
#[derive(Debug, Clone, Default)]
pub struct InstancePatch {
    /// Top-level configuration keys to replace; `null` removes the key
    pub config: Map<String, Value>,
    pub value: Option<WidgetValue>,
}

impl InstancePatch {
    pub fn set(mut self, key: &str, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.config.insert(key.to_string(), v);
            }
            Err(err) => warn!(key, error = %err, "dropping unserializable config patch entry"),
        }
        self
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.config.insert(key.to_string(), Value::Null);
        self
    }

    pub fn value(mut self, value: WidgetValue) -> Self {
        self.value = Some(value);
        self
    }
}

/// Result of [`Scene::export_snapshot`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Export {
    pub records: Vec<ExportRecord>,
    /// Instances that need a pin and have none
    pub missing_pin: Vec<String>,
    /// Instances without a resolvable widget id
    pub unresolved: Vec<String>,
}

impl Export {
    pub fn excluded(&self) -> usize {
        self.missing_pin.len() + self.unresolved.len()
    }
}

/// Ordered collection of placed widgets
#[derive(Debug)]
pub struct Scene {
    instances: IndexMap<String, WidgetInstance>,
    values: HashMap<String, WidgetValue>,
    session_tag: u64,
    next_seq: u64,
    /// Placements so far; picks the cascade slot and never goes back
    placements: usize,
    revision: u64,
}

impl Default for Scene {
    fn default() -> Self {
        Self::new()
    }
}

impl Scene {
    pub fn new() -> Self {
        let session_tag = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            instances: IndexMap::new(),
            values: HashMap::new(),
            session_tag,
            next_seq: 0,
            placements: 0,
            revision: 0,
        }
    }

    fn fresh_id(&mut self) -> String {
        loop {
            self.next_seq += 1;
            let id = format!("w-{:x}-{}", self.session_tag, self.next_seq);
            if !self.instances.contains_key(&id) {
                return id;
            }
        }
    }

    /// Places a new instance of `definition` and returns its id.
    ///
    /// Without a position the widget lands on the next cascade slot.
    pub fn add_instance(&mut self, definition: &WidgetDefinition, position: Option<Position>) -> String {
        let id = self.fresh_id();
        self.place(id, definition, position)
    }

    /// Re-creates an instance loaded from a saved template with `config`
    /// in place of the catalog template, keeping the saved id unless it is
    /// blank or already taken.
    pub fn restore_instance(
        &mut self,
        saved_id: Option<&str>,
        definition: &WidgetDefinition,
        widget_id: Option<String>,
        position: Option<Position>,
        config: ConfigDocument,
    ) -> String {
        let id = match saved_id {
            Some(id) if !id.trim().is_empty() && !self.instances.contains_key(id) => id.to_string(),
            _ => self.fresh_id(),
        };
        let id = self.place(id, definition, position);
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.widget_id = widget_id;
            instance.config = config;
        }
        id
    }

    fn place(&mut self, id: String, definition: &WidgetDefinition, position: Option<Position>) -> String {
        let position = match position {
            Some(p) => Position::new(p.x, p.y),
            None => Position::cascade(self.placements),
        };
        self.placements += 1;
        let config = definition.config_template.clone();
        let value = codec::default_value_for(&definition.kind, Some(&config.state));
        let widget_id = Some(definition.id.clone()).filter(|id| !id.trim().is_empty());

        debug!(instance_id = %id, kind = %definition.kind, x = position.x, y = position.y, "widget placed");

        self.revision += 1;
        self.values.insert(id.clone(), value.clone());
        self.instances.insert(
            id.clone(),
            WidgetInstance {
                instance_id: id.clone(),
                widget_id,
                name: definition.name.clone(),
                kind: definition.kind.clone(),
                pin_required: definition.pin_required,
                position,
                config,
                value,
            },
        );
        id
    }

    /// Removes an instance, returning it so the caller can release its pin
    pub fn remove_instance(&mut self, instance_id: &str) -> Option<WidgetInstance> {
        self.values.remove(instance_id);
        let removed = self.instances.shift_remove(instance_id);
        match removed {
            Some(_) => self.revision += 1,
            None => debug!(instance_id, "remove ignored, instance not found"),
        }
        removed
    }

    /// Sets the absolute position of an instance
    pub fn move_instance(&mut self, instance_id: &str, position: Position) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.position = Position::new(position.x, position.y);
                self.revision += 1;
                true
            }
            None => false,
        }
    }

    pub fn update_value(&mut self, instance_id: &str, value: WidgetValue) -> bool {
        match self.instances.get_mut(instance_id) {
            Some(instance) => {
                instance.value = value.clone();
                self.values.insert(instance_id.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Shallow-merges `patch` into the instance configuration.
    ///
    /// The instance is left untouched when the merged document does not
    /// decode.
    pub fn update_config(&mut self, instance_id: &str, patch: InstancePatch) -> bool {
        let Some(instance) = self.instances.get_mut(instance_id) else {
            return false;
        };

        if !patch.config.is_empty() {
            let mut merged = match serde_json::to_value(&instance.config) {
                Ok(Value::Object(map)) => map,
                _ => Map::new(),
            };
            for (key, value) in patch.config {
                if value.is_null() {
                    merged.remove(&key);
                } else {
                    merged.insert(key, value);
                }
            }
            match codec::decode(&Value::Object(merged)) {
                Some(config) => {
                    instance.config = config;
                    self.revision += 1;
                }
                None => {
                    warn!(instance_id, "configuration patch rejected");
                    return false;
                }
            }
        }

        if let Some(value) = patch.value {
            instance.value = value.clone();
            self.values.insert(instance_id.to_string(), value);
        }
        true
    }

    /// Save records for every exportable instance, plus the exclusions
    pub fn export_snapshot(&self) -> Export {
        let mut export = Export::default();

        for instance in self.instances.values() {
            let Some(widget_id) = instance.widget_id.clone().filter(|id| !id.trim().is_empty()) else {
                warn!(instance_id = %instance.instance_id, "skipping widget without a widget id");
                export.unresolved.push(instance.instance_id.clone());
                continue;
            };
            if !instance.is_exportable() {
                export.missing_pin.push(instance.instance_id.clone());
                continue;
            }
            export.records.push(ExportRecord {
                instance_id: instance.instance_id.clone(),
                widget_id,
                pin_config: instance.bound_pin().map(|p| vec![p.to_string()]).unwrap_or_default(),
                position: Position::new(instance.position.x, instance.position.y),
            });
        }

        export
    }

    pub fn get(&self, instance_id: &str) -> Option<&WidgetInstance> {
        self.instances.get(instance_id)
    }

    pub fn value_of(&self, instance_id: &str) -> Option<&WidgetValue> {
        self.values.get(instance_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WidgetInstance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance currently bound to `pin_id`
    pub fn pin_holder(&self, pin_id: &str) -> Option<&str> {
        self.instances
            .values()
            .find(|i| i.bound_pin() == Some(pin_id))
            .map(|i| i.instance_id.as_str())
    }

    /// Drops every instance; ids already handed out stay retired
    pub fn clear(&mut self) {
        self.instances.clear();
        self.values.clear();
        self.revision += 1;
    }

    /// Counter bumped by every change that affects what a save would send.
    /// Live value updates do not count.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
