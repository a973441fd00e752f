use std::collections::HashMap;
use std::future::Future;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};
use crate::backend::domain::TelemetryBackend;
use crate::config::dashboard::{DEFAULT_POWER_METER, DEFAULT_REALTIME_DEVICE};
use crate::context::domain::AppContext;
use crate::datasource::logic::latest_value;
use crate::realtime::domain::{ChannelState, ChannelStatus};
use crate::widget::domain::{DataSourceKind, ResolvedWidget, WidgetDescriptor, WidgetKind};
use crate::widget::logic::WidgetSlot;
use super::domain::{DashboardError, PanelEvent, PanelUpdate, WidgetPanel, WidgetSession};


/// Descarga todos los descriptores en paralelo. Los que fallan se registran y se omiten;
/// sólo si no queda ninguno es un error del dashboard.
#[instrument(skip(backend, widget_ids))]
pub async fn load_descriptors(backend: &dyn TelemetryBackend,
                              bundle_id: &str,
                              widget_ids: &[String]) -> Result<Vec<WidgetDescriptor>, DashboardError> {

    let fetches = widget_ids.iter().map(|widget_id| async move {
        (widget_id, backend.widget_descriptor(bundle_id, widget_id).await)
    });

    let descriptors: Vec<WidgetDescriptor> = join_all(fetches)
        .await
        .into_iter()
        .filter_map(|(widget_id, result)| match result {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                error!("Error: no se pudo cargar el widget {}: {}", widget_id, e);
                None
            }
        })
        .collect();

    if descriptors.is_empty() {
        return Err(DashboardError::NoWidgets);
    }
    info!("Info: {} de {} widgets cargados", descriptors.len(), widget_ids.len());
    Ok(descriptors)
}


/// Resuelve, despacha y, si el renderer es en vivo, suscribe un widget.
///
/// La resolución pasa por `slot`: mientras el descriptor no cambie se reutiliza
/// el resultado anterior en lugar de resolver de nuevo.
pub async fn mount_widget(context: &AppContext,
                          slot: &mut WidgetSlot,
                          descriptor: &WidgetDescriptor) -> WidgetPanel {

    let resolved = slot.resolve(&context.pipeline, descriptor).await;

    let handle = match resolved.and_then(|widget| context.dispatcher.dispatch(widget)) {
        Ok(handle) => handle,
        Err(error) => {
            warn!("Warning: widget {} no disponible: {}", descriptor.id, error);
            return WidgetPanel::Error { widget_id: descriptor.id.clone(), error };
        }
    };

    if !handle.is_live() {
        return WidgetPanel::Ready { handle, session: None };
    }

    let entity_ids = live_entity_ids(&handle.widget);
    let snapshot = initial_snapshot(context.backend.as_ref(), &handle.widget, &entity_ids).await;

    let mut subscriptions = Vec::with_capacity(entity_ids.len());
    for entity_id in &entity_ids {
        subscriptions.push(context.channel.subscribe(entity_id).await);
    }

    let session = WidgetSession::new(handle.widget.id.clone(), snapshot, subscriptions);
    WidgetPanel::Ready { handle, session: Some(session) }
}


/// Entidades a las que se suscribe un widget en vivo: las de sus fuentes `device`,
/// si no `settings.deviceId`, y si no la entidad por defecto de su tipo.
pub fn live_entity_ids(widget: &ResolvedWidget) -> Vec<String> {

    let mut ids: Vec<String> = Vec::new();
    for datasource in &widget.config.datasources {
        if datasource.kind != DataSourceKind::Device {
            continue;
        }
        if let Some(device_id) = &datasource.device_id {
            if !ids.contains(device_id) {
                ids.push(device_id.clone());
            }
        }
    }

    if ids.is_empty() {
        if let Some(device_id) = widget.config.settings.get("deviceId").and_then(Value::as_str) {
            ids.push(device_id.to_string());
        }
    }

    if ids.is_empty() {
        let fallback = match widget.kind {
            WidgetKind::PowerConsumption => DEFAULT_POWER_METER,
            _ => DEFAULT_REALTIME_DEVICE,
        };
        ids.push(fallback.to_string());
    }
    ids
}


/// Últimos valores conocidos de las entidades; si el backend no aporta ninguno,
/// se genera uno sintético por clave.
async fn initial_snapshot(backend: &dyn TelemetryBackend,
                          widget: &ResolvedWidget,
                          entity_ids: &[String]) -> HashMap<String, Value> {

    let mut snapshot = HashMap::new();
    for entity_id in entity_ids {
        match backend.entity_data(entity_id).await {
            Ok(data) => {
                for entry in data.telemetry {
                    if let Some(value) = entry.value() {
                        snapshot.insert(entry.key, value);
                    }
                }
            }
            Err(e) => warn!("Warning: sin datos actuales de {}: {}", entity_id, e),
        }
    }

    if snapshot.is_empty() {
        for key in widget.config.datasources.iter().flat_map(|ds| &ds.data_keys) {
            snapshot.insert(key.name.clone(), Value::from(latest_value(key)));
        }
    }
    snapshot
}


/// Ids de entidades en vivo que el backend no lista como dispositivos.
///
/// Sólo informa: el widget queda suscripto igual. Si el listado falla no se
/// marca ninguna.
pub async fn unknown_entities(backend: &dyn TelemetryBackend, entity_ids: &[String]) -> Vec<String> {

    let devices = match backend.list_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Warning: no se pudo listar los dispositivos: {}", e);
            return Vec::new();
        }
    };
    info!("Info: {} dispositivos registrados en el backend", devices.len());

    let mut unknown: Vec<String> = Vec::new();
    for entity_id in entity_ids {
        if !devices.iter().any(|d| &d.id == entity_id) && !unknown.contains(entity_id) {
            warn!("Warning: la entidad {} no figura entre los dispositivos", entity_id);
            unknown.push(entity_id.clone());
        }
    }
    unknown
}


/// Reenvía a la vista los valores iniciales y luego la telemetría de la sesión,
/// hasta que la vista se cierre. La sesión (y sus suscripciones) se libera al
/// terminar la tarea.
pub fn start_forwarding(mut session: WidgetSession, tx: mpsc::Sender<PanelEvent>) {

    tokio::spawn(async move {
        let snapshot = PanelEvent {
            widget_id: session.widget_id.clone(),
            update: PanelUpdate::Snapshot(std::mem::take(&mut session.snapshot)),
        };
        if tx.send(snapshot).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = tx.closed() => break,

                sample = session.next_sample() => {
                    let Some(sample) = sample else { break };
                    let event = PanelEvent { widget_id: session.widget_id.clone(), update: PanelUpdate::Live(sample) };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}


/// Espera Ctrl-C. Si no se puede instalar el manejador, la sesión termina enseguida.
pub async fn ctrl_c() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Error: no se pudo escuchar Ctrl-C: {}", e);
    }
}


/// Sesión completa del dashboard: monta los widgets, conecta el canal y muestra la
/// telemetría en vivo y los cambios de estado del canal hasta `shutdown`.
pub async fn run_session<F>(context: AppContext,
                            widget_to_display: mpsc::Sender<PanelEvent>,
                            mut display_from_widget: mpsc::Receiver<PanelEvent>,
                            shutdown: F) -> Result<(), DashboardError>
where
    F: Future<Output = ()>,
{
    let descriptors = load_descriptors(context.backend.as_ref(),
                                       &context.system.widget_bundle_id,
                                       &context.system.widget_ids).await?;

    // Un slot por widget: un id repetido en la lista no se resuelve dos veces.
    let mut slots: HashMap<String, WidgetSlot> = HashMap::new();
    let mut panels = Vec::with_capacity(descriptors.len());
    for descriptor in &descriptors {
        let slot = slots.entry(descriptor.id.clone()).or_default();
        panels.push(mount_widget(&context, slot, descriptor).await);
    }

    let failed = panels.iter().filter(|panel| panel.is_error()).count();
    info!("Info: {} widgets montados, {} con error", panels.len() - failed, failed);

    let live_ids: Vec<String> = panels
        .iter()
        .filter_map(|panel| match panel {
            WidgetPanel::Ready { session: Some(session), .. } => Some(session.entity_ids()),
            _ => None,
        })
        .flatten()
        .map(str::to_string)
        .collect();
    if !live_ids.is_empty() {
        unknown_entities(context.backend.as_ref(), &live_ids).await;
    }

    for panel in panels {
        match panel {
            WidgetPanel::Ready { handle, session } => {
                info!("Info: widget {} montado como {} ({})",
                      handle.widget.id, handle.widget.kind, handle.renderer.name);
                if let Some(session) = session {
                    start_forwarding(session, widget_to_display.clone());
                }
            }
            WidgetPanel::Error { widget_id, error } => {
                error!("Error: widget {}: {}", widget_id, error);
            }
        }
    }
    drop(widget_to_display);

    let mut status = context.channel.status();
    context.channel.connect().await;

    tokio::pin!(shutdown);
    let mut live = true;
    let mut watching = true;

    loop {
        tokio::select! {
            event = display_from_widget.recv(), if live => {
                match event {
                    Some(event) => show(&event),
                    None => {
                        info!("Info: no hay widgets en vivo");
                        live = false;
                    }
                }
            }

            changed = status.changed(), if watching => {
                match changed {
                    Ok(()) => {
                        let current = status.borrow_and_update().clone();
                        log_status(&current);
                    }
                    Err(_) => watching = false,
                }
            }

            _ = &mut shutdown => {
                info!("Info: cerrando sesión del dashboard");
                break;
            }
        }
    }

    info!("Info: canal en tiempo real {:?}, desconectando", context.channel.state());
    context.channel.disconnect().await;
    Ok(())
}


fn show(event: &PanelEvent) {
    match &event.update {
        PanelUpdate::Snapshot(values) => {
            info!(widget_id = %event.widget_id, "Info: valores iniciales {:?}", values);
        }
        PanelUpdate::Live(sample) => {
            info!(widget_id = %event.widget_id, device_id = %sample.device_id, ts = sample.timestamp_ms,
                  "Info: telemetría {:?}", sample.values);
        }
    }
}


fn log_status(status: &ChannelStatus) {
    match (status.state, &status.last_error) {
        (ChannelState::Reconnecting, Some(e)) => {
            warn!("Warning: canal en tiempo real reconectando tras un error: {}", e);
        }
        (state, _) => info!("Info: canal en tiempo real {:?}", state),
    }
}
