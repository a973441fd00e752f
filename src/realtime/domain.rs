use std::collections::HashMap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use crate::backend::domain::timestamp_ms;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}


/// Estado observable del canal. `last_error` conserva el último fallo de conexión o transporte.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub last_error: Option<ChannelError>,
}


impl Default for ChannelStatus {
    fn default() -> Self {
        Self { state: ChannelState::Disconnected, last_error: None }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("No se pudo abrir la conexión: {0}")]
    Connect(String),

    #[error("Error de transporte: {0}")]
    Transport(String),

    #[error("Mensaje entrante inválido: {0}")]
    Decode(String),

    #[error("No se pudo serializar el mensaje saliente: {0}")]
    Encode(String),

    #[error("El canal está cerrado")]
    Closed,
}


/// Mensajes del cliente hacia el servidor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    Subscribe {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Ping {},
}


impl OutboundMessage {
    pub fn subscribe(device_id: impl Into<String>) -> Self {
        OutboundMessage::Subscribe { device_id: device_id.into() }
    }

    pub fn to_text(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Encode(e.to_string()))
    }
}


/// Telemetría empujada por el servidor para una entidad.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub device_id: String,
    #[serde(default)]
    pub values: HashMap<String, Value>,
    #[serde(rename = "timestamp", deserialize_with = "timestamp_ms")]
    pub timestamp_ms: i64,
}


#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Telemetry(TelemetrySample),
    Pong,
    Unknown(String),
}


#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}


impl InboundMessage {

    /// Decodifica un frame de texto. Un `type` desconocido no es un error;
    /// sí lo es un JSON mal formado o un payload de telemetría incompleto.
    pub fn parse(text: &str) -> Result<Self, ChannelError> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| ChannelError::Decode(e.to_string()))?;

        match envelope.kind.as_str() {
            "telemetry_update" | "telemetry_data" => serde_json::from_value(envelope.payload)
                .map(InboundMessage::Telemetry)
                .map_err(|e| ChannelError::Decode(e.to_string())),
            "pong" => Ok(InboundMessage::Pong),
            _ => Ok(InboundMessage::Unknown(envelope.kind)),
        }
    }
}


/// Extremo del cliente de una conexión abierta. Cerrar `inbound` equivale a que
/// el servidor cerró la conexión.
pub struct Connection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<Result<String, ChannelError>>,
}


#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, ChannelError>;
}


#[derive(Debug)]
pub enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Send(OutboundMessage),
}
