//! Resolución de fuentes de datos.
//!
//! Cada clave de una fuente obtiene su serie según esta prioridad:
//! 1. Datos literales no vacíos: se conservan tal cual.
//! 2. Fuente `function`: serie sintética (expresión generadora o valores aleatorios).
//! 3. Fuente `device`: histórico del backend; ante cualquier fallo se usa la serie
//!    sintética de la primera clave de la fuente.
//!
//! Las fuentes se resuelven de forma concurrente y ninguna espera a otra.


use std::collections::HashMap;
use std::sync::Arc;
use chrono::Utc;
use futures_util::future::join_all;
use rand::Rng;
use tracing::{debug, instrument, warn};
use crate::backend::domain::{TelemetryBackend, TimeSeriesRequest};
use crate::config::datasource::{FETCH_INTERVAL_MS, FETCH_WINDOW_MS, MOCK_SAMPLE_COUNT, MOCK_SAMPLE_INTERVAL_MS};
use crate::widget::domain::{DataKey, DataSource, DataSourceKind, Sample};
use super::expression::{random_value, Program};


#[derive(Clone)]
pub struct DataSourceResolver {
    backend: Arc<dyn TelemetryBackend>,
}


impl DataSourceResolver {

    pub fn new(backend: Arc<dyn TelemetryBackend>) -> Self {
        Self { backend }
    }

    /// Resuelve todas las fuentes en paralelo y espera a que terminen todas.
    pub async fn resolve_all(&self, datasources: Vec<DataSource>) -> Vec<DataSource> {
        let now = Utc::now().timestamp_millis();
        join_all(datasources.into_iter().map(|ds| self.resolve_at(ds, now))).await
    }

    pub async fn resolve(&self, datasource: DataSource) -> DataSource {
        self.resolve_at(datasource, Utc::now().timestamp_millis()).await
    }

    /// Igual que `resolve`, con el instante de resolución explícito (ms epoch).
    pub async fn resolve_at(&self, datasource: DataSource, now_ms: i64) -> DataSource {
        let pending = datasource.data_keys.iter().any(|key| key.data.is_empty());
        if !pending {
            return datasource;
        }

        let fetched = match datasource.kind {
            DataSourceKind::Function => None,
            DataSourceKind::Device => Some(self.fetch_device_series(&datasource, now_ms).await),
        };

        let data_keys = datasource
            .data_keys
            .iter()
            .map(|key| {
                if !key.data.is_empty() {
                    return key.clone();
                }
                let data = match &fetched {
                    None => generate_series(key, now_ms),
                    Some(series) => series.for_key(key),
                };
                DataKey { data, ..key.clone() }
            })
            .collect();

        DataSource { data_keys, ..datasource }
    }

    /// Descarga el histórico de las claves pendientes de una fuente `device`.
    #[instrument(skip(self, datasource), fields(device_id = ?datasource.device_id))]
    async fn fetch_device_series(&self, datasource: &DataSource, now_ms: i64) -> FetchedSeries {

        let fallback = datasource
            .data_keys
            .first()
            .map(|key| generate_series(key, now_ms))
            .unwrap_or_default();

        let series = match &datasource.device_id {
            Some(device_id) => {
                let request = TimeSeriesRequest {
                    device_id: device_id.clone(),
                    keys: datasource
                        .data_keys
                        .iter()
                        .filter(|key| key.data.is_empty())
                        .map(|key| key.name.clone())
                        .collect(),
                    start_ts: now_ms - FETCH_WINDOW_MS,
                    end_ts: now_ms,
                    interval: FETCH_INTERVAL_MS,
                };
                match self.backend.fetch_timeseries(&request).await {
                    Ok(series) => series,
                    Err(e) => {
                        warn!("Warning: histórico no disponible, usando datos sintéticos: {}", e);
                        HashMap::new()
                    }
                }
            }
            None => {
                warn!("Warning: datasource de dispositivo sin deviceId, usando datos sintéticos");
                HashMap::new()
            }
        };

        let fallback = datasource
            .data_keys
            .iter()
            .filter_map(|key| series.get(&key.name))
            .find(|samples| !samples.is_empty())
            .cloned()
            .unwrap_or(fallback);

        FetchedSeries { series, fallback }
    }
}


/// Histórico descargado para una fuente `device`.
///
/// `fallback` es la primera serie no vacía en el orden de claves de la fuente,
/// o la sintética de la primera clave si el backend no trajo ninguna.
struct FetchedSeries {
    series: HashMap<String, Vec<Sample>>,
    fallback: Vec<Sample>,
}


impl FetchedSeries {

    /// Serie propia de la clave; si el backend no la trae, la de respaldo.
    fn for_key(&self, key: &DataKey) -> Vec<Sample> {
        self.series
            .get(&key.name)
            .filter(|samples| !samples.is_empty())
            .unwrap_or(&self.fallback)
            .clone()
    }
}


/// Serie sintética de `MOCK_SAMPLE_COUNT` muestras separadas `MOCK_SAMPLE_INTERVAL_MS`,
/// con la última muestra en `now_ms`.
pub fn generate_series(key: &DataKey, now_ms: i64) -> Vec<Sample> {
    generate_series_with(key, now_ms, &mut rand::thread_rng())
}


pub fn generate_series_with<R: Rng>(key: &DataKey, now_ms: i64, rng: &mut R) -> Vec<Sample> {
    let program = compile(key);
    let mut samples = Vec::with_capacity(MOCK_SAMPLE_COUNT);
    let mut prev = 0.0;

    for i in 0..MOCK_SAMPLE_COUNT {
        let ts = now_ms - (MOCK_SAMPLE_COUNT - 1 - i) as i64 * MOCK_SAMPLE_INTERVAL_MS;
        let value = match &program {
            Some(program) => program.eval(prev, rng).unwrap_or_else(|e| {
                debug!("Debug: fallo evaluando {} en muestra {}: {}", key.name, i, e);
                random_value(rng)
            }),
            None => random_value(rng),
        };
        samples.push(Sample(ts, value));
        prev = value;
    }

    samples
}


/// Un único valor sintético para refrescos en vivo sin dispositivo asociado.
pub fn latest_value(key: &DataKey) -> f64 {
    let mut rng = rand::thread_rng();
    match compile(key) {
        Some(program) => program.eval(0.0, &mut rng).unwrap_or_else(|_| random_value(&mut rng)),
        None => random_value(&mut rng),
    }
}


fn compile(key: &DataKey) -> Option<Program> {
    let body = key.func_body.as_deref().filter(|body| !body.trim().is_empty())?;
    match Program::parse(body) {
        Ok(program) => Some(program),
        Err(e) => {
            warn!("Warning: funcBody inválido en {}: {}", key.name, e);
            None
        }
    }
}
