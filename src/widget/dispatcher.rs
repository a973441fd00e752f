//! Registro cerrado de renderers por tipo de widget.


use tracing::{debug, warn};
use super::domain::{ResolvedWidget, WidgetError, WidgetKind};


/// Capacidad de renderizado registrada para un tipo de widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Renderer {
    pub name: &'static str,
    /// Necesita una suscripción al canal en tiempo real mientras esté montado.
    pub live: bool,
}


/// Widget emparejado con su renderer, listo para la capa de presentación.
#[derive(Debug, Clone, PartialEq)]
pub struct RendererHandle {
    pub renderer: Renderer,
    pub widget: ResolvedWidget,
}


impl RendererHandle {
    pub fn is_live(&self) -> bool {
        self.renderer.live
    }
}


#[derive(Debug, Clone, Default)]
pub struct WidgetDispatcher;


impl WidgetDispatcher {

    pub fn new() -> Self {
        Self
    }

    /// Busca el renderer del tipo ya resuelto (el extraído de la plantilla).
    pub fn dispatch(&self, widget: ResolvedWidget) -> Result<RendererHandle, WidgetError> {
        match renderer_for(&widget.kind) {
            Some(renderer) => {
                debug!("Debug: widget {} asignado al renderer {}", widget.id, renderer.name);
                Ok(RendererHandle { renderer, widget })
            }
            None => {
                warn!("Warning: tipo de widget {} sin renderer", widget.kind);
                Err(WidgetError::UnsupportedWidgetType(widget.kind.name().to_string()))
            }
        }
    }
}


fn renderer_for(kind: &WidgetKind) -> Option<Renderer> {
    let (name, live) = match kind {
        WidgetKind::TimeSeriesChart => ("time-series-chart", false),
        WidgetKind::BarChart => ("bar-chart", false),
        WidgetKind::PieChart => ("pie-chart", false),
        WidgetKind::PowerButton => ("power-button", false),
        WidgetKind::SliderWidget => ("slider", false),
        WidgetKind::LedIndicator => ("led-indicator", false),
        WidgetKind::ActionButton => ("action-button", false),
        WidgetKind::ToggleButton => ("toggle-button", false),
        WidgetKind::CommandButton => ("command-button", false),
        WidgetKind::RealTimeDemo => ("real-time-demo", true),
        WidgetKind::PowerConsumption => ("power-consumption", true),
        WidgetKind::DoughnutChart | WidgetKind::Unsupported(_) => return None,
    };
    Some(Renderer { name, live })
}


#[cfg(test)]
mod tests {
    use crate::widget::domain::ResolvedConfig;
    use super::*;

    fn widget(kind: WidgetKind) -> ResolvedWidget {
        ResolvedWidget {
            id: "w1".to_string(),
            kind,
            declared_type: "timeseries".to_string(),
            config: ResolvedConfig::default(),
            template_html: String::new(),
            template_css: String::new(),
        }
    }

    #[test]
    fn registered_kind_dispatches() {
        let handle = WidgetDispatcher::new().dispatch(widget(WidgetKind::TimeSeriesChart)).unwrap();
        assert_eq!(handle.renderer.name, "time-series-chart");
        assert!(!handle.is_live());
    }

    #[test]
    fn unknown_kind_names_the_type() {
        let err = WidgetDispatcher::new()
            .dispatch(widget(WidgetKind::from_name("UnknownThing")))
            .unwrap_err();
        assert_eq!(err, WidgetError::UnsupportedWidgetType("UnknownThing".to_string()));
        assert_eq!(err.to_string(), "Widget type 'UnknownThing' not supported");
    }

    #[test]
    fn doughnut_has_no_renderer() {
        let err = WidgetDispatcher::new().dispatch(widget(WidgetKind::DoughnutChart)).unwrap_err();
        assert!(matches!(err, WidgetError::UnsupportedWidgetType(name) if name == "DoughnutChart"));
    }

    #[test]
    fn realtime_kinds_are_live() {
        let dispatcher = WidgetDispatcher::new();
        for kind in [WidgetKind::RealTimeDemo, WidgetKind::PowerConsumption] {
            assert!(dispatcher.dispatch(widget(kind)).unwrap().is_live());
        }
    }
}
