//! Módulo de configuración central y gestión del entorno de ejecución.
//!
//! Este módulo actúa como la fuente única de verdad para la configuración del dashboard.
//! Se encarga de leer las variables de entorno, establecer valores por defecto
//! y configurar la observabilidad (logs) del proceso.
//!
//! # Funcionalidades Principales
//! * **Carga de Configuración:** Lee de `.env` en desarrollo y variables de sistema en producción.
//! * **Observabilidad:** Configura `tracing_subscriber` para logs estructurados o legibles.
//!


use std::env;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use url::Url;
use crate::config::dashboard::{DEFAULT_BUNDLE_ID, DEFAULT_WIDGET_IDS};


/// Representa la configuración global del sistema y el estado del entorno.
#[derive(Debug, Clone)]
pub struct System {
    /// URL base del backend de telemetría (ej. `http://localhost:8080`).
    pub backend_url: String,

    /// URL del canal de tiempo real (ej. `ws://localhost:8080/ws`).
    pub realtime_url: String,

    /// Bundle del que se descargan los descriptores de widgets.
    pub widget_bundle_id: String,

    /// Widgets que componen el dashboard, en orden.
    pub widget_ids: Vec<String>,

    /// Timeout total de cada petición HTTP.
    /// Por defecto: `10` segundos.
    pub http_timeout_secs: u64,

    /// Entorno de ejecución actual (`development`, `staging`, `production`).
    /// Afecta el formato de logs y la carga de archivos `.env`.
    pub environment: String,

    /// Nivel de detalle de los logs (ej. `info`, `debug`, `warn`).
    /// Se autoconfigura según el `environment` si no se especifica.
    pub rust_log: String,
}


/// Errores de configuración detectados al arrancar.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} debe ser un número: {value}")]
    NotANumber { name: &'static str, value: String },

    #[error("{name} no es una URL válida: {source}")]
    InvalidUrl { name: &'static str, source: url::ParseError },

    #[error("WIDGET_IDS no contiene ningún widget")]
    EmptyWidgetList,
}


impl System {

    /// Carga la configuración desde las variables de entorno.
    ///
    /// # Comportamiento
    /// * Si `ENVIRONMENT` es "development", intenta cargar un archivo `.env`.
    /// * Establece valores por defecto para todas las variables.
    ///
    /// # Errores
    /// * Si `HTTP_TIMEOUT_SECS` no es un número.
    /// * Si `BACKEND_URL` o `REALTIME_URL` no son URLs válidas.
    pub fn new() -> Result<Self, ConfigError> {

        let environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "development".into());

        if environment == "development" {
            dotenv::dotenv().ok();
        }

        let backend_url = env::var("BACKEND_URL")
            .unwrap_or("http://localhost:8080".to_string());
        Url::parse(&backend_url)
            .map_err(|source| ConfigError::InvalidUrl { name: "BACKEND_URL", source })?;

        let realtime_url = env::var("REALTIME_URL")
            .unwrap_or("ws://localhost:8080/ws".to_string());
        Url::parse(&realtime_url)
            .map_err(|source| ConfigError::InvalidUrl { name: "REALTIME_URL", source })?;

        let timeout = env::var("HTTP_TIMEOUT_SECS").unwrap_or("10".to_string());
        let http_timeout_secs = timeout
            .parse()
            .map_err(|_| ConfigError::NotANumber { name: "HTTP_TIMEOUT_SECS", value: timeout })?;

        let widget_ids = match env::var("WIDGET_IDS") {
            Ok(list) => parse_widget_ids(&list)?,
            Err(_) => DEFAULT_WIDGET_IDS.iter().map(|id| id.to_string()).collect(),
        };

        Ok(System {
            backend_url,
            realtime_url,

            widget_bundle_id: env::var("WIDGET_BUNDLE_ID")
                .unwrap_or(DEFAULT_BUNDLE_ID.to_string()),

            widget_ids,
            http_timeout_secs,

            rust_log: env::var("RUST_LOG")
                .unwrap_or_else(|_| {
                    match environment.as_str() {
                        "development" => "debug".to_string(),
                        "staging" => "info".to_string(),
                        _ => "warn".to_string(),
                    }
                }),

            environment,
        })
    }
}


fn parse_widget_ids(list: &str) -> Result<Vec<String>, ConfigError> {
    let ids: Vec<String> = list
        .split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect();

    if ids.is_empty() {
        return Err(ConfigError::EmptyWidgetList);
    }
    Ok(ids)
}


/// Inicializa el sistema de trazabilidad y logs (Tracing).
///
/// Configura el formato de salida basándose en el entorno:
/// * **Production**: Salida JSON (para logs estructurados en la nube).
/// * **Development/Otros**: Salida "Pretty" (colores y formato legible).
pub fn init_tracing(system: &System) {

    let filter = EnvFilter::try_new(&system.rust_log)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = fmt().with_env_filter(filter).with_target(false);

    if system.environment == "production" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }

    info!("Info: tracing inicializado ({})", system.environment);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widget_ids_are_trimmed_and_empty_entries_skipped() {
        let ids = parse_widget_ids(" a , b,,c ").unwrap();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_widget_list_is_rejected() {
        assert!(matches!(parse_widget_ids(" , "), Err(ConfigError::EmptyWidgetList)));
    }
}
