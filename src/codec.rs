//! Widget configuration codec
//!
//! Catalog entries and saved templates carry the widget configuration either
//! as a JSON object or as a JSON document embedded in a string. Everything
//! past this module works with the decoded [`ConfigDocument`]; raw JSON only
//! exists at the gateway boundary.
//!
//! None of these functions fail: malformed input degrades to `None` (logged
//! through `tracing`) and callers fall back to built-in defaults.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Fallback colour for colour pickers without a configured default
pub const DEFAULT_COLOR: &str = "#2196F3";

/// Fallback value for sliders and gauges
pub const DEFAULT_LEVEL: f64 = 50.0;

/// Decoded widget configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub widget_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appearance: Option<Appearance>,
    #[serde(default)]
    pub state: StateDefaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation: Option<Animation>,
    #[serde(rename = "pinConfig", default, skip_serializing_if = "Option::is_none")]
    pub pin_config: Option<PinBinding>,
    /// Keys this crate does not interpret, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigDocument {
    /// Id of the bound virtual pin, if any
    pub fn bound_pin(&self) -> Option<&str> {
        self.pin_config.as_ref().and_then(PinBinding::pin_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Appearance {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub colors: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Animation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hover: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Type-specific defaults and the numeric range of the bound pin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_color: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub current_value: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64", skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference to a virtual pin inside `pinConfig`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PinRef {
    Id(String),
    Pin {
        #[serde(alias = "_id")]
        id: String,
        #[serde(default, deserialize_with = "lenient_u32", skip_serializing_if = "Option::is_none")]
        pin_id: Option<u32>,
    },
}

impl PinRef {
    pub fn id(&self) -> &str {
        match self {
            PinRef::Id(id) => id,
            PinRef::Pin { id, .. } => id,
        }
    }

    pub fn device_index(&self) -> Option<u32> {
        match self {
            PinRef::Id(_) => None,
            PinRef::Pin { pin_id, .. } => *pin_id,
        }
    }
}

/// `pinConfig` as found in the wild: a single reference, or a legacy list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PinBinding {
    Single(PinRef),
    List(Vec<PinRef>),
}

impl PinBinding {
    /// Binding to one concrete pin
    pub fn bound(id: impl Into<String>, pin_id: Option<u32>) -> Self {
        PinBinding::Single(PinRef::Pin {
            id: id.into(),
            pin_id,
        })
    }

    fn first(&self) -> Option<&PinRef> {
        match self {
            PinBinding::Single(pin) => Some(pin).filter(|p| !p.id().trim().is_empty()),
            PinBinding::List(pins) => pins.iter().find(|p| !p.id().trim().is_empty()),
        }
    }

    /// Id of the first concrete pin reference
    pub fn pin_id(&self) -> Option<&str> {
        self.first().map(PinRef::id)
    }

    /// Device-facing index of the first concrete pin reference
    pub fn device_index(&self) -> Option<u32> {
        self.first().and_then(PinRef::device_index)
    }
}

/// Normalized widget kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WidgetType {
    Switch,
    Slider,
    Gauge,
    Button,
    ToggleButton,
    TextInput,
    NumberInput,
    ColorPicker,
    /// Unrecognized tag, lower-cased
    Other(String),
    /// Empty or missing tag
    Unknown,
}

impl WidgetType {
    pub fn as_str(&self) -> &str {
        match self {
            WidgetType::Switch => "switch",
            WidgetType::Slider => "slider",
            WidgetType::Gauge => "gauge",
            WidgetType::Button => "button",
            WidgetType::ToggleButton => "toggle_button",
            WidgetType::TextInput => "text_input",
            WidgetType::NumberInput => "number_input",
            WidgetType::ColorPicker => "color_picker",
            WidgetType::Other(tag) => tag,
            WidgetType::Unknown => "unknown",
        }
    }

    /// Whether the playground can drive this kind
    pub fn is_supported(&self) -> bool {
        !matches!(self, WidgetType::Other(_) | WidgetType::Unknown)
    }
}

impl std::fmt::Display for WidgetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WidgetType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Live value of a placed widget
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WidgetValue {
    Bool(bool),
    Number(f64),
    Text(String),
    #[default]
    Null,
}

impl WidgetValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            WidgetValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<bool> for WidgetValue {
    fn from(value: bool) -> Self {
        WidgetValue::Bool(value)
    }
}

impl From<f64> for WidgetValue {
    fn from(value: f64) -> Self {
        WidgetValue::Number(value)
    }
}

impl From<&str> for WidgetValue {
    fn from(value: &str) -> Self {
        WidgetValue::Text(value.to_string())
    }
}

impl From<String> for WidgetValue {
    fn from(value: String) -> Self {
        WidgetValue::Text(value)
    }
}

impl From<Value> for WidgetValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(b) => WidgetValue::Bool(b),
            Value::Number(n) => n.as_f64().map(WidgetValue::Number).unwrap_or_default(),
            Value::String(s) => WidgetValue::Text(s),
            _ => WidgetValue::Null,
        }
    }
}

/// Reads a number or a numeric string. Anything else, including
/// non-finite values, is `None`.
pub fn coerce_number(raw: &Value) -> Option<f64> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Non-negative integral number, as used for device pin indexes
pub fn coerce_index(raw: &Value) -> Option<u32> {
    coerce_number(raw)
        .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= f64::from(u32::MAX))
        .map(|v| v as u32)
}

/// `deserialize_with` helper: an unreadable number degrades to `None`
/// instead of failing the whole document
pub(crate) fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    let parsed = coerce_number(&raw);
    if parsed.is_none() && !raw.is_null() {
        debug!(value = %raw, "ignoring non-numeric value");
    }
    Ok(parsed)
}

pub(crate) fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    let parsed = coerce_index(&raw);
    if parsed.is_none() && !raw.is_null() {
        debug!(value = %raw, "ignoring invalid pin index");
    }
    Ok(parsed)
}

/// Decodes a configuration given as an object or as a JSON string.
pub fn decode(raw: &Value) -> Option<ConfigDocument> {
    match raw {
        Value::Object(_) => match ConfigDocument::deserialize(raw) {
            Ok(doc) => Some(doc),
            Err(err) => {
                warn!(error = %err, "widget configuration has an unexpected shape");
                None
            }
        },
        Value::String(text) => decode_str(text),
        Value::Null => {
            debug!("widget configuration missing");
            None
        }
        other => {
            warn!(value = %other, "widget configuration is neither an object nor a JSON string");
            None
        }
    }
}

/// Decodes a JSON-encoded configuration string.
pub fn decode_str(text: &str) -> Option<ConfigDocument> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => decode(&value),
        // double-encoded documents show up in older templates
        Ok(Value::String(inner)) => decode_str(&inner),
        Ok(other) => {
            warn!(value = %other, "widget configuration string does not hold an object");
            None
        }
        Err(err) => {
            warn!(error = %err, "malformed widget configuration JSON");
            None
        }
    }
}

/// Serializes a configuration to its transport form.
pub fn encode(doc: &ConfigDocument) -> String {
    match serde_json::to_string(doc) {
        Ok(text) => text,
        Err(err) => {
            warn!(error = %err, "failed to encode widget configuration");
            "{}".to_string()
        }
    }
}

/// Maps a free-form widget tag onto [`WidgetType`].
pub fn normalize_type(raw: &str) -> WidgetType {
    let lowered = raw.trim().to_lowercase();
    let tag = lowered.strip_prefix("3d_").unwrap_or(&lowered);

    match tag {
        "" => WidgetType::Unknown,
        "switch" | "toggle" => WidgetType::Switch,
        "slider" | "range" => WidgetType::Slider,
        "gauge" | "meter" => WidgetType::Gauge,
        "button" | "pushbutton" => WidgetType::Button,
        "toggle_button" => WidgetType::ToggleButton,
        "number_input" | "numberinput" | "number" => WidgetType::NumberInput,
        "text_input" | "textinput" | "text" => WidgetType::TextInput,
        "color_picker" | "colorpicker" | "color" => WidgetType::ColorPicker,
        other => WidgetType::Other(other.to_string()),
    }
}

/// Type of a decoded configuration, `Unknown` when absent.
pub fn document_type(doc: Option<&ConfigDocument>) -> WidgetType {
    doc.and_then(|d| d.widget_type.as_deref())
        .map(normalize_type)
        .unwrap_or(WidgetType::Unknown)
}

/// Default live value for a widget kind, honouring configured overrides.
pub fn default_value_for(kind: &WidgetType, state: Option<&StateDefaults>) -> WidgetValue {
    match kind {
        WidgetType::Switch | WidgetType::ToggleButton | WidgetType::Button => {
            let configured = state.and_then(|s| {
                [s.default.as_ref(), s.default_value.as_ref()]
                    .into_iter()
                    .flatten()
                    .find_map(Value::as_bool)
            });
            WidgetValue::Bool(configured.unwrap_or(false))
        }
        WidgetType::Slider | WidgetType::Gauge | WidgetType::NumberInput => {
            let fallback = if *kind == WidgetType::NumberInput { 0.0 } else { DEFAULT_LEVEL };
            let configured = state.and_then(|s| {
                [s.default_value.as_ref(), s.default.as_ref()]
                    .into_iter()
                    .flatten()
                    .find_map(Value::as_f64)
            });
            WidgetValue::Number(configured.unwrap_or(fallback))
        }
        WidgetType::TextInput => {
            let configured = state.and_then(|s| {
                s.default_text
                    .clone()
                    .or_else(|| s.default.as_ref().and_then(Value::as_str).map(str::to_string))
            });
            WidgetValue::Text(configured.unwrap_or_default())
        }
        WidgetType::ColorPicker => {
            let configured = state.and_then(|s| {
                s.default_color
                    .clone()
                    .or_else(|| s.default.as_ref().and_then(Value::as_str).map(str::to_string))
            });
            WidgetValue::Text(configured.unwrap_or_else(|| DEFAULT_COLOR.to_string()))
        }
        WidgetType::Other(_) | WidgetType::Unknown => WidgetValue::Null,
    }
}
