//! Contexto de aplicación compartido.
//!
//! `AppContext` agrupa los recursos que usan varias tareas a la vez: la configuración,
//! el cliente del backend, el pipeline de resolución de widgets y el único canal en
//! tiempo real de la sesión. Se clona barato y se pasa explícitamente a quien lo necesite.


use std::sync::Arc;
use std::time::Duration;
use url::Url;
use crate::backend::domain::{BackendError, TelemetryBackend};
use crate::backend::logic::HttpBackend;
use crate::datasource::logic::DataSourceResolver;
use crate::realtime::domain::Connector;
use crate::realtime::logic::RealtimeChannel;
use crate::realtime::transport::WsConnector;
use crate::system::domain::System;
use crate::widget::dispatcher::WidgetDispatcher;
use crate::widget::logic::WidgetResolutionPipeline;


#[derive(Clone)]
pub struct AppContext {
    pub system: Arc<System>,
    pub backend: Arc<dyn TelemetryBackend>,
    pub pipeline: WidgetResolutionPipeline,
    pub dispatcher: WidgetDispatcher,
    pub channel: RealtimeChannel,
}


impl AppContext {

    /// Construye el contexto de producción: backend HTTP y canal WebSocket.
    pub fn new(system: System) -> Result<Self, BackendError> {
        let backend = HttpBackend::new(&system.backend_url, Duration::from_secs(system.http_timeout_secs))?;
        let connector = WsConnector::new(Url::parse(&system.realtime_url)?);
        Ok(Self::with_parts(system, Arc::new(backend), Arc::new(connector)))
    }

    /// Arma el contexto con un backend y un conector cualesquiera.
    pub fn with_parts(system: System,
                      backend: Arc<dyn TelemetryBackend>,
                      connector: Arc<dyn Connector>) -> Self {

        let pipeline = WidgetResolutionPipeline::new(DataSourceResolver::new(backend.clone()));
        Self {
            system: Arc::new(system),
            backend,
            pipeline,
            dispatcher: WidgetDispatcher::new(),
            channel: RealtimeChannel::start(connector),
        }
    }
}
