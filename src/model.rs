//! Catalog, template and pin types exchanged with the cloud service.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::codec::{self, ConfigDocument, WidgetType};

/// Canvas coordinates in pixels. Always finite.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    /// Builds a position, replacing non-finite axes with 0
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: finite_or_zero(x),
            y: finite_or_zero(y),
        }
    }

    /// Slot used when a widget is placed without an explicit position
    pub fn cascade(slot: usize) -> Self {
        let offset = 100.0 + 50.0 * slot as f64;
        Self::new(offset, offset)
    }

    /// Reads `{x, y}` leniently: numbers or numeric strings, anything else is 0
    pub fn from_json(raw: &Value) -> Option<Self> {
        let obj = raw.as_object()?;
        Some(Self::new(
            obj.get("x").map(coerce_axis).unwrap_or(0.0),
            obj.get("y").map(coerce_axis).unwrap_or(0.0),
        ))
    }

    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + finite_or_zero(dx), self.y + finite_or_zero(dy))
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(Self::from_json(&raw).unwrap_or_default())
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() { v } else { 0.0 }
}

fn coerce_axis(raw: &Value) -> f64 {
    codec::coerce_number(raw).unwrap_or(0.0)
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(codec::lenient_f64(deserializer)?.unwrap_or_default())
}

fn lenient_index<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    Ok(codec::lenient_u32(deserializer)?.unwrap_or_default())
}

/// Widget reference found in a saved template entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetRef {
    Resolved(String),
    Unresolved,
}

impl WidgetRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            WidgetRef::Resolved(id) => Some(id),
            WidgetRef::Unresolved => None,
        }
    }
}

/// Resolves a `widget_id` field that may be a string or a nested object.
///
/// Priority: the string itself, then the object's `_id`, then its `id`.
/// Blank ids count as unresolved.
pub fn resolve_widget_ref(raw: &Value) -> WidgetRef {
    let candidate = match raw {
        Value::String(id) => Some(id.as_str()),
        Value::Object(obj) => ["_id", "id"]
            .iter()
            .filter_map(|key| obj.get(*key).and_then(Value::as_str))
            .find(|id| !id.trim().is_empty()),
        _ => None,
    };
    match candidate {
        Some(id) if !id.trim().is_empty() => WidgetRef::Resolved(id.to_string()),
        _ => WidgetRef::Unresolved,
    }
}

/// Catalog entry as sent by the service
#[derive(Debug, Clone, Deserialize)]
pub struct WidgetRecord {
    #[serde(rename = "_id", alias = "id", default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(rename = "pinRequired", default)]
    pub pin_required: u32,
    #[serde(alias = "config", default)]
    pub configuration: Value,
}

/// Catalog widget with its configuration decoded
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetDefinition {
    pub id: String,
    pub name: String,
    pub kind: WidgetType,
    pub pin_required: u32,
    pub config_template: ConfigDocument,
}

impl WidgetDefinition {
    /// Definition for entries whose widget is not in the catalog
    pub fn placeholder(id: Option<&str>) -> Self {
        Self {
            id: id.unwrap_or_default().to_string(),
            name: String::new(),
            kind: WidgetType::Unknown,
            pin_required: 0,
            config_template: ConfigDocument::default(),
        }
    }

    pub fn requires_pin(&self) -> bool {
        self.pin_required > 0
    }
}

impl From<WidgetRecord> for WidgetDefinition {
    fn from(record: WidgetRecord) -> Self {
        let config_template = codec::decode(&record.configuration).unwrap_or_default();
        let kind = match record.kind.as_deref() {
            Some(tag) if !tag.trim().is_empty() => codec::normalize_type(tag),
            _ => codec::document_type(Some(&config_template)),
        };
        Self {
            id: record.id,
            name: record.name,
            kind,
            pin_required: record.pin_required,
            config_template,
        }
    }
}

/// Virtual pin owned by the template service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualPin {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(deserialize_with = "lenient_index")]
    pub pin_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin_name: Option<String>,
    #[serde(default)]
    pub is_used: bool,
    #[serde(default, deserialize_with = "lenient_number")]
    pub min_value: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub max_value: f64,
    #[serde(default, deserialize_with = "lenient_number")]
    pub value: f64,
}

/// Body of `PUT /templates/{id}/virtualPins/{pinId}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinUpdate {
    pub pin_id: u32,
    pub pin_name: String,
    pub value: f64,
    pub min_value: f64,
    pub max_value: f64,
    pub is_used: bool,
}

/// Template list entry
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TemplateSummary {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub template_name: String,
}

/// Pin reference inside a saved widget entry
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SavedPin {
    Id(String),
    Pin(VirtualPin),
}

impl SavedPin {
    pub fn id(&self) -> &str {
        match self {
            SavedPin::Id(id) => id,
            SavedPin::Pin(pin) => &pin.id,
        }
    }
}

/// One widget of a saved template
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateWidget {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub widget_id: Value,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(rename = "pinConfig", default, deserialize_with = "saved_pins")]
    pub pin_config: Vec<SavedPin>,
}

fn saved_pins<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<SavedPin>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<SavedPin>),
        One(SavedPin),
        Nothing(()),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(pins) => pins,
        OneOrMany::One(pin) => vec![pin],
        OneOrMany::Nothing(()) => Vec::new(),
    })
}

/// Template with its widgets and pins
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDetail {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub template_name: String,
    #[serde(default)]
    pub widget_list: Vec<TemplateWidget>,
    #[serde(default)]
    pub virtual_pins: Vec<VirtualPin>,
}

/// Widget entry of a save request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRecord {
    pub instance_id: String,
    pub widget_id: String,
    #[serde(rename = "pinConfig")]
    pub pin_config: Vec<String>,
    pub position: Position,
}

/// Body of `POST /templates` and `PUT /templates/{id}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplatePayload {
    pub template_name: String,
    pub widget_list: Vec<ExportRecord>,
}
