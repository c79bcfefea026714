//! In-memory template service for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::{self, ConfigDocument};
use crate::error::{Error, Result};
use crate::gateway::TemplateGateway;
use crate::model::{
    ExportRecord, PinUpdate, SavedPin, TemplateDetail, TemplatePayload, TemplateSummary,
    TemplateWidget, VirtualPin, WidgetDefinition,
};

pub fn definition(id: &str, kind: &str, pin_required: u32) -> WidgetDefinition {
    WidgetDefinition {
        id: id.to_string(),
        name: id.to_uppercase(),
        kind: codec::normalize_type(kind),
        pin_required,
        config_template: ConfigDocument {
            widget_type: Some(kind.to_string()),
            ..Default::default()
        },
    }
}

pub fn pin(id: &str, pin_id: u32, is_used: bool) -> VirtualPin {
    VirtualPin {
        id: id.to_string(),
        pin_id,
        pin_name: Some(format!("V{pin_id}")),
        is_used,
        min_value: 0.0,
        max_value: 100.0,
        value: 0.0,
    }
}

#[derive(Default)]
struct State {
    widgets: Vec<WidgetDefinition>,
    template_name: String,
    widget_list: Vec<ExportRecord>,
    pins: Vec<VirtualPin>,
    fail_next: Option<Error>,
    fail_call: Option<(&'static str, Error)>,
    omit_instance_ids: bool,
    saved: Vec<TemplatePayload>,
    pin_updates: Vec<(String, PinUpdate)>,
    deleted_pins: Vec<String>,
}

/// Fake service holding a single template, `t1`
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<State>,
}

impl FakeGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        gateway.state.lock().template_name = "Test template".to_string();
        gateway
    }

    pub fn with_widgets(widgets: Vec<WidgetDefinition>) -> Self {
        let gateway = Self::new();
        gateway.state.lock().widgets = widgets;
        gateway
    }

    pub fn set_pins(&self, pins: Vec<VirtualPin>) {
        self.state.lock().pins = pins;
    }

    pub fn set_widget_list(&self, list: Vec<ExportRecord>) {
        self.state.lock().widget_list = list;
    }

    /// Makes the next call fail with `err`
    pub fn fail_next(&self, err: Error) {
        self.state.lock().fail_next = Some(err);
    }

    /// Makes the next call to the gateway method `op` fail with `err`
    pub fn fail_call(&self, op: &'static str, err: Error) {
        self.state.lock().fail_call = Some((op, err));
    }

    /// Serves `widget_list` entries without `instance_id`
    pub fn omit_instance_ids(&self) {
        self.state.lock().omit_instance_ids = true;
    }

    pub fn saved(&self) -> Vec<TemplatePayload> {
        self.state.lock().saved.clone()
    }

    pub fn pin_updates(&self) -> Vec<(String, PinUpdate)> {
        self.state.lock().pin_updates.clone()
    }

    pub fn deleted_pins(&self) -> Vec<String> {
        self.state.lock().deleted_pins.clone()
    }

    fn check(&self, op: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        match state.fail_call.take() {
            Some((target, err)) if target == op => Err(err),
            pending => {
                state.fail_call = pending;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TemplateGateway for FakeGateway {
    async fn list_widgets(&self) -> Result<Vec<WidgetDefinition>> {
        self.check("list_widgets")?;
        Ok(self.state.lock().widgets.clone())
    }

    async fn list_templates(&self) -> Result<Vec<TemplateSummary>> {
        self.check("list_templates")?;
        let state = self.state.lock();
        Ok(vec![TemplateSummary {
            id: "t1".to_string(),
            template_name: state.template_name.clone(),
        }])
    }

    async fn fetch_template(&self, template_id: &str) -> Result<TemplateDetail> {
        self.check("fetch_template")?;
        let state = self.state.lock();
        Ok(TemplateDetail {
            id: template_id.to_string(),
            template_name: state.template_name.clone(),
            widget_list: state
                .widget_list
                .iter()
                .map(|r| TemplateWidget {
                    instance_id: (!state.omit_instance_ids).then(|| r.instance_id.clone()),
                    widget_id: Value::String(r.widget_id.clone()),
                    position: Some(r.position),
                    pin_config: r.pin_config.iter().cloned().map(SavedPin::Id).collect(),
                })
                .collect(),
            virtual_pins: state.pins.clone(),
        })
    }

    async fn create_template(&self, payload: &TemplatePayload) -> Result<TemplateSummary> {
        self.check("create_template")?;
        let mut state = self.state.lock();
        state.template_name = payload.template_name.clone();
        state.widget_list = payload.widget_list.clone();
        Ok(TemplateSummary {
            id: "t1".to_string(),
            template_name: payload.template_name.clone(),
        })
    }

    async fn update_template(&self, _template_id: &str, payload: &TemplatePayload) -> Result<()> {
        self.check("update_template")?;
        let mut state = self.state.lock();
        state.widget_list = payload.widget_list.clone();
        state.saved.push(payload.clone());
        Ok(())
    }

    async fn update_pin(&self, _template_id: &str, pin_id: &str, update: &PinUpdate) -> Result<()> {
        self.check("update_pin")?;
        let mut state = self.state.lock();
        let pin = state
            .pins
            .iter_mut()
            .find(|p| p.id == pin_id)
            .ok_or_else(|| Error::Server {
                status: 404,
                message: format!("pin {pin_id} not found"),
            })?;
        pin.is_used = true;
        pin.value = update.value;
        pin.min_value = update.min_value;
        pin.max_value = update.max_value;
        state.pin_updates.push((pin_id.to_string(), update.clone()));
        Ok(())
    }

    async fn delete_pin(&self, _template_id: &str, pin_id: &str) -> Result<()> {
        self.check("delete_pin")?;
        let mut state = self.state.lock();
        if let Some(pin) = state.pins.iter_mut().find(|p| p.id == pin_id) {
            pin.is_used = false;
        }
        state.deleted_pins.push(pin_id.to_string());
        Ok(())
    }
}
