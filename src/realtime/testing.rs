//! Conexiones en memoria para pruebas del canal.


use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use super::domain::{ChannelError, Connection, Connector};


/// Extremo del servidor de una conexión simulada. Soltarlo equivale a un cierre remoto.
pub struct Server {
    pub to_client: mpsc::Sender<Result<String, ChannelError>>,
    pub from_client: mpsc::Receiver<String>,
}


impl Server {
    pub async fn push(&self, message: Value) {
        self.to_client.send(Ok(message.to_string())).await.unwrap();
    }

    pub async fn next_message(&mut self) -> Value {
        let text = self.from_client.recv().await.unwrap();
        serde_json::from_str(&text).unwrap()
    }
}


/// Cada `connect()` entrega el extremo del servidor por `servers`, salvo los
/// intentos que se hayan marcado para rechazar.
pub struct MockConnector {
    servers: mpsc::UnboundedSender<Server>,
    attempts: AtomicUsize,
    refusals: AtomicUsize,
}


impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Server>) {
        let (servers, rx_servers) = mpsc::unbounded_channel();
        let connector = Self { servers, attempts: AtomicUsize::new(0), refusals: AtomicUsize::new(0) };
        (Arc::new(connector), rx_servers)
    }

    /// Los próximos `count` intentos fallan con `ChannelError::Connect`.
    pub fn refuse(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}


#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Connection, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self.refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ChannelError::Connect("conexión rechazada".to_string()));
        }
        let (to_client, inbound) = mpsc::channel(16);
        let (outbound, from_client) = mpsc::channel(16);
        self.servers
            .send(Server { to_client, from_client })
            .map_err(|_| ChannelError::Connect("sin servidor".to_string()))?;
        Ok(Connection { outbound, inbound })
    }
}
