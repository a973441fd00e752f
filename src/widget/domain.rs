//! Dominio de Widgets.
//!
//! Define el descriptor tal como llega del backend, los resultados intermedios de la
//! resolución (`ParsedTemplate`, `ResolvedConfig`) y el contrato final `ResolvedWidget`
//! que consume la capa de presentación.


use std::fmt;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;


/// Declaración de un widget entregada por el backend. Inmutable una vez descargada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetDescriptor {
    pub id: String,
    /// Tipo declarado por el backend (`timeseries`, `latest`, ...). No decide el renderer.
    #[serde(rename = "type")]
    pub declared_type: String,
    pub size_x: u32,
    pub size_y: u32,
    pub template_html: String,
    pub template_css: String,
    /// Configuración por defecto codificada como texto JSON.
    pub default_config: String,
    pub has_basic_mode: bool,
}


/// Tipos de widget conocidos por el dashboard.
///
/// Cualquier nombre fuera de la lista se conserva en `Unsupported` para poder
/// mostrarlo en el panel de error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WidgetKind {
    TimeSeriesChart,
    BarChart,
    PieChart,
    DoughnutChart,
    PowerButton,
    SliderWidget,
    LedIndicator,
    ActionButton,
    ToggleButton,
    CommandButton,
    RealTimeDemo,
    PowerConsumption,
    Unsupported(String),
}


const SELECTORS: [(&str, WidgetKind); 12] = [
    ("tb-time-series-chart-widget", WidgetKind::TimeSeriesChart),
    ("tb-bar-chart-widget", WidgetKind::BarChart),
    ("tb-pie-chart-widget", WidgetKind::PieChart),
    ("tb-doughnut-widget", WidgetKind::DoughnutChart),
    ("tb-power-button-widget", WidgetKind::PowerButton),
    ("tb-slider-widget", WidgetKind::SliderWidget),
    ("tb-led-indicator-widget", WidgetKind::LedIndicator),
    ("tb-action-button-widget", WidgetKind::ActionButton),
    ("tb-toggle-button-widget", WidgetKind::ToggleButton),
    ("tb-command-button-widget", WidgetKind::CommandButton),
    ("tb-real-time-demo-widget", WidgetKind::RealTimeDemo),
    ("tb-power-consumption-widget", WidgetKind::PowerConsumption),
];


impl WidgetKind {

    /// Busca el tipo correspondiente a un selector de plantilla (`tb-<kind>-widget`).
    pub fn from_selector(selector: &str) -> Option<WidgetKind> {
        SELECTORS
            .iter()
            .find(|(name, _)| *name == selector)
            .map(|(_, kind)| kind.clone())
    }

    /// Conversión total desde el nombre canónico; los desconocidos quedan como `Unsupported`.
    pub fn from_name(name: &str) -> WidgetKind {
        SELECTORS
            .iter()
            .map(|(_, kind)| kind)
            .find(|kind| kind.name() == name)
            .cloned()
            .unwrap_or_else(|| WidgetKind::Unsupported(name.to_string()))
    }

    pub fn selectors() -> impl Iterator<Item = &'static str> {
        SELECTORS.iter().map(|(name, _)| *name)
    }

    pub fn name(&self) -> &str {
        match self {
            WidgetKind::TimeSeriesChart => "TimeSeriesChart",
            WidgetKind::BarChart => "BarChart",
            WidgetKind::PieChart => "PieChart",
            WidgetKind::DoughnutChart => "DoughnutChart",
            WidgetKind::PowerButton => "PowerButton",
            WidgetKind::SliderWidget => "SliderWidget",
            WidgetKind::LedIndicator => "LedIndicator",
            WidgetKind::ActionButton => "ActionButton",
            WidgetKind::ToggleButton => "ToggleButton",
            WidgetKind::CommandButton => "CommandButton",
            WidgetKind::RealTimeDemo => "RealTimeDemo",
            WidgetKind::PowerConsumption => "PowerConsumption",
            WidgetKind::Unsupported(name) => name,
        }
    }
}


impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}


/// Resultado de validar una plantilla.
///
/// `widget_type` es `None` si y sólo si `is_valid` es `false`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTemplate {
    pub clean_html: String,
    pub widget_type: Option<WidgetKind>,
    pub is_valid: bool,
}


/// Muestra de una serie temporal: `[timestamp_ms, valor]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample(#[serde(deserialize_with = "timestamp_from_number")] pub i64, pub f64);


fn timestamp_from_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    // El backend serializa las series como `[][]float64`.
    let ts = f64::deserialize(deserializer)?;
    Ok(ts as i64)
}


/// Un `null` explícito vale lo mismo que un campo ausente.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}


/// Origen de datos de una fuente: telemetría de un dispositivo o generador sintético.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DataSourceKind {
    Device,
    Function,
}


impl From<String> for DataSourceKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "function" => DataSourceKind::Function,
            _ => DataSourceKind::Device,
        }
    }
}


impl From<DataSourceKind> for String {
    fn from(kind: DataSourceKind) -> Self {
        match kind {
            DataSourceKind::Device => "device".to_string(),
            DataSourceKind::Function => "function".to_string(),
        }
    }
}


impl Default for DataSourceKind {
    fn default() -> Self {
        DataSourceKind::Device
    }
}


/// Una serie con nombre dentro de una fuente de datos.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataKey {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub label: String,
    #[serde(deserialize_with = "null_as_default")]
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub func_body: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub data: Vec<Sample>,
    /// Campos adicionales del descriptor que se conservan sin interpretar.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataSource {
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub kind: DataSourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub data_keys: Vec<DataKey>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}


/// Proyección tipada del `defaultConfig` del descriptor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub datasources: Vec<DataSource>,
    pub settings: Value,
    pub timewindow: Value,
    pub title: String,
    pub show_title: bool,
    pub background_color: String,
    pub color: String,
    pub padding: String,
    pub units: String,
    pub decimals: u32,
    pub drop_shadow: bool,
    pub enable_fullscreen: bool,
}


impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            datasources: Vec::new(),
            settings: Value::Object(Map::new()),
            timewindow: Value::Object(Map::new()),
            title: String::new(),
            show_title: true,
            background_color: "transparent".to_string(),
            color: "rgba(0, 0, 0, 0.87)".to_string(),
            padding: "0px".to_string(),
            units: String::new(),
            decimals: 0,
            drop_shadow: true,
            enable_fullscreen: false,
        }
    }
}


/// Widget completamente materializado, listo para el renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedWidget {
    pub id: String,
    #[serde(rename = "type", serialize_with = "kind_as_name")]
    pub kind: WidgetKind,
    pub declared_type: String,
    pub config: ResolvedConfig,
    pub template_html: String,
    pub template_css: String,
}


fn kind_as_name<S: serde::Serializer>(kind: &WidgetKind, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(kind.name())
}


impl ResolvedWidget {

    /// Ensambla el widget final. Sólo es posible a partir de una plantilla válida;
    /// el tipo extraído de la plantilla prevalece sobre el tipo declarado del descriptor.
    pub fn assemble(template: ParsedTemplate,
                    descriptor: &WidgetDescriptor,
                    config: ResolvedConfig) -> Result<Self, WidgetError> {

        let kind = match (template.is_valid, template.widget_type) {
            (true, Some(kind)) => kind,
            _ => return Err(WidgetError::InvalidTemplate(preview(&descriptor.template_html))),
        };

        Ok(Self {
            id: descriptor.id.clone(),
            kind,
            declared_type: descriptor.declared_type.clone(),
            config,
            template_html: template.clean_html,
            template_css: descriptor.template_css.clone(),
        })
    }
}


/// Errores recuperables a nivel de un único widget.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WidgetError {
    #[error("Invalid widget template: {0}")]
    InvalidTemplate(String),

    #[error("Widget type '{0}' not supported")]
    UnsupportedWidgetType(String),
}


/// Primeros caracteres de una plantilla, para mensajes de error acotados.
pub(crate) fn preview(html: &str) -> String {
    const MAX: usize = 80;
    match html.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &html[..idx]),
        None => html.to_string(),
    }
}
