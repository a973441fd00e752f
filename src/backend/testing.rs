//! Backend en memoria para pruebas.


use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use crate::widget::domain::{Sample, WidgetDescriptor};
use super::domain::{BackendError, Device, EntityTelemetry, TelemetryBackend, TimeSeriesRequest};


#[derive(Default)]
pub struct StubBackend {
    pub series: Option<HashMap<String, Vec<Sample>>>,
    pub descriptors: HashMap<String, WidgetDescriptor>,
    pub entities: HashMap<String, EntityTelemetry>,
    pub devices: Option<Vec<Device>>,
    pub requests: Mutex<Vec<TimeSeriesRequest>>,
    pub calls: AtomicUsize,
}


impl StubBackend {

    /// Todas las peticiones de histórico fallan.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_series(series: HashMap<String, Vec<Sample>>) -> Arc<Self> {
        Arc::new(Self { series: Some(series), ..Self::default() })
    }

    pub fn with_descriptors(descriptors: Vec<WidgetDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            descriptors: descriptors.into_iter().map(|d| (d.id.clone(), d)).collect(),
            ..Self::default()
        })
    }

    pub fn with_entities(entities: Vec<EntityTelemetry>) -> Arc<Self> {
        Arc::new(Self {
            entities: entities.into_iter().map(|e| (e.entity_id.clone(), e)).collect(),
            ..Self::default()
        })
    }

    pub fn with_devices(devices: Vec<Device>) -> Arc<Self> {
        Arc::new(Self { devices: Some(devices), ..Self::default() })
    }

    pub fn timeseries_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}


#[async_trait]
impl TelemetryBackend for StubBackend {

    async fn list_devices(&self) -> Result<Vec<Device>, BackendError> {
        self.devices
            .clone()
            .ok_or_else(|| BackendError::Status { status: 503, message: "down".to_string() })
    }

    async fn fetch_timeseries(&self,
                              request: &TimeSeriesRequest) -> Result<HashMap<String, Vec<Sample>>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        self.series
            .clone()
            .ok_or_else(|| BackendError::Status { status: 503, message: "down".to_string() })
    }

    async fn entity_data(&self, entity_id: &str) -> Result<EntityTelemetry, BackendError> {
        self.entities
            .get(entity_id)
            .cloned()
            .ok_or_else(|| BackendError::Application(format!("unknown entity {entity_id}")))
    }

    async fn widget_descriptor(&self,
                               _bundle_id: &str,
                               widget_id: &str) -> Result<WidgetDescriptor, BackendError> {
        self.descriptors
            .get(widget_id)
            .cloned()
            .ok_or_else(|| BackendError::Status { status: 404, message: format!("widget {widget_id}") })
    }
}


/// Descriptor mínimo con la plantilla y configuración dadas.
pub fn descriptor(id: &str, template_html: &str, default_config: &str) -> WidgetDescriptor {
    WidgetDescriptor {
        id: id.to_string(),
        declared_type: "timeseries".to_string(),
        size_x: 8,
        size_y: 5,
        template_html: template_html.to_string(),
        template_css: String::new(),
        default_config: default_config.to_string(),
        has_basic_mode: false,
    }
}
