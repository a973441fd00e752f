//! Pipeline de resolución de widgets: plantilla → configuración → datos.


use tracing::{debug, instrument, warn};
use crate::datasource::logic::DataSourceResolver;
use super::descriptor::parse_descriptor;
use super::domain::{preview, ResolvedWidget, WidgetDescriptor, WidgetError};
use super::template::parse_template;


#[derive(Clone)]
pub struct WidgetResolutionPipeline {
    resolver: DataSourceResolver,
}


impl WidgetResolutionPipeline {

    pub fn new(resolver: DataSourceResolver) -> Self {
        Self { resolver }
    }

    /// Resuelve un descriptor completo.
    ///
    /// Una plantilla sin tipo reconocible produce `InvalidTemplate`; un `defaultConfig`
    /// inválido nunca es un error (se usan los valores por defecto). El widget sólo se
    /// entrega cuando todas las fuentes de datos han terminado de resolverse.
    #[instrument(name = "resolve_widget", skip(self, descriptor), fields(widget_id = %descriptor.id))]
    pub async fn resolve(&self, descriptor: &WidgetDescriptor) -> Result<ResolvedWidget, WidgetError> {

        let template = parse_template(&descriptor.template_html);
        if !template.is_valid {
            warn!("Warning: plantilla sin tipo de widget reconocible");
            return Err(WidgetError::InvalidTemplate(preview(&descriptor.template_html)));
        }

        let mut config = parse_descriptor(descriptor);
        let datasources = std::mem::take(&mut config.datasources);
        config.datasources = self.resolver.resolve_all(datasources).await;

        let widget = ResolvedWidget::assemble(template, descriptor, config)?;
        debug!("Debug: widget resuelto como {}", widget.kind);
        Ok(widget)
    }
}


/// Resultado memorizado de la resolución de un descriptor.
///
/// Sólo se vuelve a resolver cuando cambia el descriptor; mientras sea el mismo
/// se devuelve el resultado anterior.
#[derive(Default)]
pub struct WidgetSlot {
    cached: Option<(WidgetDescriptor, Result<ResolvedWidget, WidgetError>)>,
}


impl WidgetSlot {

    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&mut self,
                         pipeline: &WidgetResolutionPipeline,
                         descriptor: &WidgetDescriptor) -> Result<ResolvedWidget, WidgetError> {

        if let Some((cached, resolved)) = &self.cached {
            if cached == descriptor {
                return resolved.clone();
            }
        }
        let resolved = pipeline.resolve(descriptor).await;
        self.cached = Some((descriptor.clone(), resolved.clone()));
        resolved
    }
}
