//! Interpretación del `defaultConfig` de un descriptor.
//!
//! Cada campo se evalúa por separado: un campo ausente, vacío o con un tipo
//! inesperado toma su valor por defecto sin afectar a los demás. Un JSON inválido
//! produce la configuración por defecto completa.


use serde_json::{Map, Value};
use tracing::warn;
use super::domain::{DataSource, ResolvedConfig, WidgetDescriptor};


pub fn parse_descriptor(descriptor: &WidgetDescriptor) -> ResolvedConfig {
    let raw = match serde_json::from_str::<Value>(&descriptor.default_config) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!("Warning: defaultConfig del widget {} no es un objeto", descriptor.id);
            Map::new()
        }
        Err(e) => {
            warn!("Warning: defaultConfig inválido en widget {}: {}", descriptor.id, e);
            Map::new()
        }
    };
    config_from_map(&raw)
}


fn config_from_map(raw: &Map<String, Value>) -> ResolvedConfig {
    let defaults = ResolvedConfig::default();

    ResolvedConfig {
        datasources: datasources(raw.get("datasources")),
        settings: object_or(raw.get("settings"), defaults.settings),
        timewindow: object_or(raw.get("timewindow"), defaults.timewindow),
        title: text_or(raw.get("title"), defaults.title),
        show_title: not_false(raw.get("showTitle")),
        background_color: text_or(raw.get("backgroundColor"), defaults.background_color),
        color: text_or(raw.get("color"), defaults.color),
        padding: text_or(raw.get("padding"), defaults.padding),
        units: text_or(raw.get("units"), defaults.units),
        decimals: raw
            .get("decimals")
            .and_then(Value::as_f64)
            .filter(|d| d.is_finite() && *d >= 0.0)
            .map(|d| d.trunc() as u32)
            .unwrap_or(defaults.decimals),
        drop_shadow: not_false(raw.get("dropShadow")),
        enable_fullscreen: raw
            .get("enableFullscreen")
            .and_then(Value::as_bool)
            .unwrap_or(defaults.enable_fullscreen),
    }
}


fn datasources(value: Option<&Value>) -> Vec<DataSource> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value::<DataSource>(item.clone()) {
            Ok(ds) => Some(ds),
            Err(e) => {
                warn!("Warning: datasource descartada: {}", e);
                None
            }
        })
        .collect()
}


fn text_or(value: Option<&Value>, default: String) -> String {
    match value.and_then(Value::as_str) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ => default,
    }
}


fn object_or(value: Option<&Value>, default: Value) -> Value {
    match value {
        Some(v @ Value::Object(_)) => v.clone(),
        _ => default,
    }
}


/// `true` salvo que el valor sea explícitamente `false`.
fn not_false(value: Option<&Value>) -> bool {
    !matches!(value, Some(Value::Bool(false)))
}
