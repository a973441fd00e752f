use std::collections::HashMap;
use futures_util::StreamExt;
use futures_util::stream::select_all;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use crate::realtime::domain::TelemetrySample;
use crate::realtime::logic::Subscription;
use crate::widget::dispatcher::RendererHandle;
use crate::widget::domain::WidgetError;


/// Único error que afecta al dashboard entero.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DashboardError {
    #[error("No se pudo cargar ningún widget del dashboard")]
    NoWidgets,
}


/// Resultado de montar un widget. Un error queda confinado a su propio panel.
pub enum WidgetPanel {
    Ready {
        handle: RendererHandle,
        session: Option<WidgetSession>,
    },
    Error {
        widget_id: String,
        error: WidgetError,
    },
}


impl WidgetPanel {

    pub fn widget_id(&self) -> &str {
        match self {
            WidgetPanel::Ready { handle, .. } => &handle.widget.id,
            WidgetPanel::Error { widget_id, .. } => widget_id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, WidgetPanel::Error { .. })
    }
}


/// Suscripciones de un widget en vivo mientras está montado.
///
/// Soltar la sesión libera todas sus suscripciones, también en caminos de error.
pub struct WidgetSession {
    pub widget_id: String,
    /// Últimos valores conocidos al montar, por clave.
    pub snapshot: HashMap<String, Value>,
    subscriptions: Vec<Subscription>,
}


impl WidgetSession {

    pub fn new(widget_id: String, snapshot: HashMap<String, Value>, subscriptions: Vec<Subscription>) -> Self {
        Self { widget_id, snapshot, subscriptions }
    }

    pub fn entity_ids(&self) -> Vec<&str> {
        self.subscriptions.iter().map(Subscription::entity_id).collect()
    }

    /// Próxima muestra de cualquiera de las entidades suscriptas.
    pub async fn next_sample(&mut self) -> Option<TelemetrySample> {
        select_all(self.subscriptions.iter_mut()).next().await
    }
}


impl Drop for WidgetSession {
    fn drop(&mut self) {
        debug!("Debug: liberando {} suscripciones del widget {}", self.subscriptions.len(), self.widget_id);
    }
}


/// Actualización dirigida al panel de un widget.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelEvent {
    pub widget_id: String,
    pub update: PanelUpdate,
}


#[derive(Debug, Clone, PartialEq)]
pub enum PanelUpdate {
    /// Valores conocidos al montar; siempre es el primer evento de una sesión.
    Snapshot(HashMap<String, Value>),
    Live(TelemetrySample),
}
