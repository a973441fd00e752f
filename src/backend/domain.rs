//! Contratos del backend de telemetría consumidos por el dashboard.
//!
//! Los modelos reflejan las respuestas JSON de la API (`camelCase`). El trait
//! `TelemetryBackend` es la costura que permite sustituir el cliente HTTP en pruebas.


use std::collections::HashMap;
use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use crate::config::dashboard::{DEFAULT_SIZE_X, DEFAULT_SIZE_Y, DEFAULT_WIDGET_TYPE};
use crate::widget::domain::{Sample, WidgetDescriptor};


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub location: String,
}


/// Petición de histórico para un dispositivo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesRequest {
    pub device_id: String,
    pub keys: Vec<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub interval: i64,
}


#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSeriesData {
    pub device_id: String,
    pub data: HashMap<String, Vec<Sample>>,
}


#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityTelemetry {
    pub entity_id: String,
    #[serde(default)]
    pub telemetry: Vec<TelemetryEntry>,
}


/// Una lectura con su valor en una de las columnas tipadas.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub key: String,
    #[serde(deserialize_with = "timestamp_ms")]
    pub ts: i64,
    pub bool_val: Option<bool>,
    pub int_val: Option<i64>,
    pub double_val: Option<f64>,
    pub string_val: Option<String>,
    pub json_val: Option<String>,
}


impl TelemetryEntry {

    /// Primer valor presente, en el orden bool, int, double, string, json.
    pub fn value(&self) -> Option<Value> {
        if let Some(v) = self.bool_val {
            return Some(Value::from(v));
        }
        if let Some(v) = self.int_val {
            return Some(Value::from(v));
        }
        if let Some(v) = self.double_val {
            return Some(Value::from(v));
        }
        if let Some(v) = &self.string_val {
            return Some(Value::from(v.clone()));
        }
        self.json_val
            .as_ref()
            .map(|raw| serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw.clone())))
    }
}


/// Sobre común de las respuestas `{success, data, error}`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default = "default_success")]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}


fn default_success() -> bool {
    true
}


/// Registro de widget tal como lo devuelve el endpoint de bundles.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WidgetRecord {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub widget_type: Option<String>,
    pub size_x: Option<u32>,
    pub size_y: Option<u32>,
    pub template_html: Option<Value>,
    pub descriptor: Option<RawDescriptor>,
}


#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawDescriptor {
    pub template_html: Option<Value>,
    pub template_css: Option<String>,
    pub size_x: Option<u32>,
    pub size_y: Option<u32>,
    pub default_config: Option<String>,
    pub has_basic_mode: Option<bool>,
}


impl WidgetRecord {

    /// Normaliza el registro aplicando los valores por defecto del dashboard.
    /// La plantilla es obligatoria: sin ella el widget no puede resolverse.
    pub fn into_descriptor(self, widget_id: &str) -> Result<WidgetDescriptor, BackendError> {
        let raw = self.descriptor.unwrap_or_default();

        let template_html = non_empty_text(raw.template_html.as_ref())
            .or_else(|| non_empty_text(self.template_html.as_ref()))
            .ok_or_else(|| BackendError::Application(format!("Template HTML is empty for widget {widget_id}")))?;

        Ok(WidgetDescriptor {
            id: self.id.filter(|id| !id.is_empty()).unwrap_or_else(|| widget_id.to_string()),
            declared_type: self
                .widget_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| DEFAULT_WIDGET_TYPE.to_string()),
            size_x: raw.size_x.or(self.size_x).filter(|s| *s > 0).unwrap_or(DEFAULT_SIZE_X),
            size_y: raw.size_y.or(self.size_y).filter(|s| *s > 0).unwrap_or(DEFAULT_SIZE_Y),
            template_html,
            template_css: raw.template_css.unwrap_or_default(),
            default_config: raw
                .default_config
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "{}".to_string()),
            has_basic_mode: raw.has_basic_mode.unwrap_or(false),
        })
    }
}


fn non_empty_text(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}


/// Acepta un instante como milisegundos epoch o como texto RFC 3339.
pub fn timestamp_ms<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| serde::de::Error::custom("timestamp fuera de rango")),
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.timestamp_millis())
            .map_err(serde::de::Error::custom),
        other => Err(serde::de::Error::custom(format!("timestamp inválido: {other}"))),
    }
}


fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("clave inválida: {other}"))),
    }
}


#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Server error {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Backend reported failure: {0}")]
    Application(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}


/// Operaciones del backend de las que depende el núcleo del dashboard.
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<Device>, BackendError>;

    async fn fetch_timeseries(&self,
                              request: &TimeSeriesRequest) -> Result<HashMap<String, Vec<Sample>>, BackendError>;

    async fn entity_data(&self, entity_id: &str) -> Result<EntityTelemetry, BackendError>;

    async fn widget_descriptor(&self,
                               bundle_id: &str,
                               widget_id: &str) -> Result<WidgetDescriptor, BackendError>;
}


#[cfg(test)]
mod tests {
    use serde_json::json;
    use super::*;

    #[test]
    fn entry_value_prefers_typed_columns_in_order() {
        let entry: TelemetryEntry = serde_json::from_value(json!({
            "key": 3, "ts": "2024-05-01T10:00:00Z", "intVal": 5, "stringVal": "x"
        })).unwrap();
        assert_eq!(entry.key, "3");
        assert_eq!(entry.ts, 1_714_557_600_000);
        assert_eq!(entry.value(), Some(json!(5)));

        let entry: TelemetryEntry = serde_json::from_value(json!({
            "key": "state", "ts": 1, "jsonVal": "{\"on\":true}"
        })).unwrap();
        assert_eq!(entry.value(), Some(json!({"on": true})));
    }

    #[test]
    fn record_defaults_follow_the_dashboard_shell() {
        let record: WidgetRecord = serde_json::from_value(json!({
            "descriptor": {"templateHtml": "<tb-bar-chart-widget></tb-bar-chart-widget>"}
        })).unwrap();
        let descriptor = record.into_descriptor("w-9").unwrap();
        assert_eq!(descriptor.id, "w-9");
        assert_eq!(descriptor.declared_type, "timeseries");
        assert_eq!((descriptor.size_x, descriptor.size_y), (8, 5));
        assert_eq!(descriptor.default_config, "{}");
        assert!(!descriptor.has_basic_mode);
    }

    #[test]
    fn record_template_falls_back_to_top_level_and_is_required() {
        let record: WidgetRecord = serde_json::from_value(json!({
            "id": "w1", "templateHtml": "<tb-slider-widget></tb-slider-widget>", "descriptor": {"templateHtml": ""}
        })).unwrap();
        assert_eq!(record.into_descriptor("w1").unwrap().template_html, "<tb-slider-widget></tb-slider-widget>");

        let record: WidgetRecord = serde_json::from_value(json!({"id": "w2", "templateHtml": 42})).unwrap();
        assert!(matches!(record.into_descriptor("w2"), Err(BackendError::Application(_))));
    }
}
