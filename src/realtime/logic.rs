//! Canal compartido de telemetría en tiempo real.
//!
//! Una única tarea (`channel_task`) es dueña de la conexión y recorre la máquina de estados
//! Disconnected → Connecting → Connected → Reconnecting. El resto del programa sólo habla
//! con ella a través de `RealtimeChannel`.


use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_stream::Stream;
use tracing::{debug, error, info, instrument, warn};
use crate::config::realtime::{COMMAND_BUFFER, PING_INTERVAL, RECONNECT_DELAY};
use super::domain::{ChannelError, ChannelState, ChannelStatus, Command, Connection, Connector,
                    InboundMessage, OutboundMessage, TelemetrySample};


struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<TelemetrySample>,
}


/// Oyentes por id de entidad, compartidos entre el handle y la tarea del canal.
#[derive(Clone, Default)]
struct Registry {
    listeners: Arc<DashMap<String, Vec<Listener>>>,
    next_id: Arc<AtomicU64>,
}


impl Registry {

    /// Devuelve el id del oyente y si la entidad no tenía oyentes hasta ahora.
    fn add(&self, entity_id: &str, tx: mpsc::UnboundedSender<TelemetrySample>) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entry = self.listeners.entry(entity_id.to_string()).or_default();
        let is_new = entry.is_empty();
        entry.push(Listener { id, tx });
        (id, is_new)
    }

    fn remove(&self, entity_id: &str, listener_id: u64) {
        let empty = match self.listeners.get_mut(entity_id) {
            Some(mut listeners) => {
                listeners.retain(|l| l.id != listener_id);
                listeners.is_empty()
            }
            None => false,
        };
        if empty {
            self.listeners.remove_if(entity_id, |_, listeners| listeners.is_empty());
        }
    }

    /// Entrega la muestra a cada oyente de su entidad, en orden de llegada.
    fn dispatch(&self, sample: &TelemetrySample) -> usize {
        match self.listeners.get(&sample.device_id) {
            Some(listeners) => listeners
                .iter()
                .filter(|l| l.tx.send(sample.clone()).is_ok())
                .count(),
            None => 0,
        }
    }

    fn entity_ids(&self) -> Vec<String> {
        self.listeners.iter().map(|entry| entry.key().clone()).collect()
    }

    fn count(&self, entity_id: &str) -> usize {
        self.listeners.get(entity_id).map_or(0, |listeners| listeners.len())
    }
}


/// Registro de interés en una entidad. Al soltarse deja de recibir mensajes.
pub struct Subscription {
    entity_id: String,
    listener_id: u64,
    registry: Registry,
    rx: mpsc::UnboundedReceiver<TelemetrySample>,
}


impl Subscription {

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub async fn recv(&mut self) -> Option<TelemetrySample> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}


impl Stream for Subscription {
    type Item = TelemetrySample;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}


impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.entity_id, self.listener_id);
    }
}


/// Handle clonable del canal en tiempo real.
#[derive(Clone)]
pub struct RealtimeChannel {
    tx_commands: mpsc::Sender<Command>,
    status: watch::Receiver<ChannelStatus>,
    registry: Registry,
}


impl RealtimeChannel {

    /// Crea el canal y lanza su tarea. El canal arranca desconectado.
    pub fn start(connector: Arc<dyn Connector>) -> Self {
        let (tx_commands, rx_commands) = mpsc::channel(COMMAND_BUFFER);
        let (tx_status, status) = watch::channel(ChannelStatus::default());
        let registry = Registry::default();

        let actor = ChannelActor {
            connector,
            registry: registry.clone(),
            rx_commands,
            tx_status,
            last_error: None,
        };
        tokio::spawn(channel_task(actor));

        Self { tx_commands, status, registry }
    }

    pub async fn connect(&self) {
        self.command(Command::Connect).await;
    }

    /// Fuerza `Disconnected` y cancela cualquier reconexión pendiente. Al volver,
    /// la conexión ya fue liberada y no se entregan más mensajes.
    pub async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        self.command(Command::Disconnect(ack)).await;
        let _ = done.await;
    }

    /// Registra un oyente para `entity_id`. No abre conexiones; si el canal está
    /// conectado y la entidad es nueva, se le envía un `subscribe` al servidor.
    /// En cualquier otro estado el `subscribe` sale al abrirse la conexión.
    pub async fn subscribe(&self, entity_id: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let (listener_id, is_new) = self.registry.add(entity_id, tx);
        if is_new {
            self.send(OutboundMessage::subscribe(entity_id)).await;
        }
        Subscription { entity_id: entity_id.to_string(), listener_id, registry: self.registry.clone(), rx }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        subscription.unsubscribe();
    }

    /// Envía un mensaje si el canal está conectado; si no, se descarta.
    pub async fn send(&self, message: OutboundMessage) {
        self.command(Command::Send(message)).await;
    }

    pub fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn state(&self) -> ChannelState {
        self.status.borrow().state
    }

    pub fn listener_count(&self, entity_id: &str) -> usize {
        self.registry.count(entity_id)
    }

    async fn command(&self, command: Command) {
        if self.tx_commands.send(command).await.is_err() {
            error!("Error: la tarea del canal en tiempo real terminó");
        }
    }
}


enum Step {
    Idle,
    Connect,
    Live(Connection),
    Retry,
    Stop,
}


struct ChannelActor {
    connector: Arc<dyn Connector>,
    registry: Registry,
    rx_commands: mpsc::Receiver<Command>,
    tx_status: watch::Sender<ChannelStatus>,
    last_error: Option<ChannelError>,
}


async fn channel_task(mut actor: ChannelActor) {

    let mut step = Step::Idle;

    loop {
        step = match step {
            Step::Idle => actor.idle().await,
            Step::Connect => actor.connecting().await,
            Step::Live(connection) => actor.connected(connection).await,
            Step::Retry => actor.reconnecting().await,
            Step::Stop => {
                actor.publish(ChannelState::Disconnected);
                info!("Info: todos los handles del canal se soltaron, terminando tarea");
                return;
            }
        };
    }
}


impl ChannelActor {

    fn publish(&self, state: ChannelState) {
        self.tx_status.send_replace(ChannelStatus { state, last_error: self.last_error.clone() });
    }

    async fn idle(&mut self) -> Step {
        self.publish(ChannelState::Disconnected);

        loop {
            match self.rx_commands.recv().await {
                Some(Command::Connect) => return Step::Connect,
                Some(Command::Disconnect(ack)) => {
                    let _ = ack.send(());
                }
                Some(Command::Send(message)) => {
                    debug!("Debug: canal desconectado, se descarta {:?}", message);
                }
                None => return Step::Stop,
            }
        }
    }

    #[instrument(skip(self))]
    async fn connecting(&mut self) -> Step {
        self.publish(ChannelState::Connecting);

        let connector = Arc::clone(&self.connector);
        let attempt = connector.connect();
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return match result {
                        Ok(mut connection) => {
                            info!("Info: canal en tiempo real conectado");
                            self.last_error = None;
                            match self.subscribe_all(&mut connection).await {
                                Ok(()) => Step::Live(connection),
                                Err(e) => self.failed(e),
                            }
                        }
                        Err(e) => self.failed(e),
                    };
                }

                command = self.rx_commands.recv() => {
                    match command {
                        Some(Command::Disconnect(ack)) => return self.disconnected(ack),
                        Some(Command::Send(message)) => {
                            debug!("Debug: canal conectándose, se descarta {:?}", message);
                        }
                        Some(Command::Connect) => {}
                        None => return Step::Stop,
                    }
                }
            }
        }
    }

    async fn connected(&mut self, mut connection: Connection) -> Step {
        self.publish(ChannelState::Connected);

        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = connection.inbound.recv() => {
                    match frame {
                        Some(Ok(text)) => self.handle_frame(&text),
                        Some(Err(e)) => return self.failed(e),
                        None => {
                            warn!("Warning: conexión cerrada por el servidor");
                            return Step::Retry;
                        }
                    }
                }

                _ = ping.tick() => {
                    if let Err(e) = send(&mut connection, &OutboundMessage::Ping {}).await {
                        return self.failed(e);
                    }
                }

                command = self.rx_commands.recv() => {
                    let outcome = match command {
                        Some(Command::Send(message)) => send(&mut connection, &message).await,
                        Some(Command::Connect) => Ok(()),
                        Some(Command::Disconnect(ack)) => {
                            drop(connection);
                            info!("Info: canal en tiempo real desconectado");
                            return self.disconnected(ack);
                        }
                        None => return Step::Stop,
                    };
                    if let Err(e) = outcome {
                        return self.failed(e);
                    }
                }
            }
        }
    }

    /// Un único temporizador por cierre; un `connect()` mientras espera no agrega otro.
    async fn reconnecting(&mut self) -> Step {
        self.publish(ChannelState::Reconnecting);
        debug!("Debug: reintento de conexión en {:?}", RECONNECT_DELAY);

        let delay = sleep(RECONNECT_DELAY);
        tokio::pin!(delay);

        loop {
            tokio::select! {
                _ = &mut delay => return Step::Connect,

                command = self.rx_commands.recv() => {
                    match command {
                        Some(Command::Disconnect(ack)) => return self.disconnected(ack),
                        Some(Command::Send(message)) => {
                            debug!("Debug: canal reconectándose, se descarta {:?}", message);
                        }
                        Some(Command::Connect) => {}
                        None => return Step::Stop,
                    }
                }
            }
        }
    }

    fn disconnected(&self, ack: oneshot::Sender<()>) -> Step {
        self.publish(ChannelState::Disconnected);
        let _ = ack.send(());
        Step::Idle
    }

    fn failed(&mut self, e: ChannelError) -> Step {
        error!("Error: canal en tiempo real: {}", e);
        self.last_error = Some(e);
        Step::Retry
    }

    async fn subscribe_all(&self, connection: &mut Connection) -> Result<(), ChannelError> {
        for entity_id in self.registry.entity_ids() {
            send(connection, &OutboundMessage::subscribe(entity_id)).await?;
        }
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        match InboundMessage::parse(text) {
            Ok(InboundMessage::Telemetry(sample)) => {
                let delivered = self.registry.dispatch(&sample);
                debug!("Debug: telemetría de {} entregada a {} oyentes", sample.device_id, delivered);
            }
            Ok(InboundMessage::Pong) => debug!("Debug: pong recibido"),
            Ok(InboundMessage::Unknown(kind)) => warn!("Warning: tipo de mensaje desconocido: {}", kind),
            Err(e) => warn!("Warning: {}", e),
        }
    }
}


async fn send(connection: &mut Connection, message: &OutboundMessage) -> Result<(), ChannelError> {
    let text = message.to_text()?;
    connection.outbound.send(text).await.map_err(|_| ChannelError::Closed)
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::time::timeout;
    use crate::realtime::testing::{MockConnector, Server};
    use super::*;

    fn channel() -> (RealtimeChannel, mpsc::UnboundedReceiver<Server>, Arc<MockConnector>) {
        let (connector, servers) = MockConnector::new();
        (RealtimeChannel::start(connector.clone()), servers, connector)
    }

    fn telemetry(device_id: &str, value: f64) -> Value {
        json!({
            "type": "telemetry_update",
            "payload": {"deviceId": device_id, "values": {"temperature": value}, "timestamp": 1700000000000_i64}
        })
    }

    fn assert_around(elapsed: Duration, expected: Duration) {
        assert!(elapsed >= expected && elapsed < expected + Duration::from_millis(100), "{elapsed:?} != {expected:?}");
    }

    async fn wait_for(channel: &RealtimeChannel, state: ChannelState) {
        channel.status().wait_for(|status| status.state == state).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_registered_entities_on_open() {
        let (channel, mut servers, _) = channel();
        let _sub = channel.subscribe("device_001").await;

        channel.connect().await;
        let mut server = servers.recv().await.unwrap();

        assert_eq!(server.next_message().await, json!({"type": "subscribe", "payload": {"deviceId": "device_001"}}));
        wait_for(&channel, ChannelState::Connected).await;
    }

    #[tokio::test(start_paused = true)]
    async fn new_entity_is_announced_while_connected() {
        let (channel, mut servers, connector) = channel();
        channel.connect().await;
        let mut server = servers.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        let _first = channel.subscribe("device_002").await;
        let _second = channel.subscribe("device_002").await;

        assert_eq!(server.next_message().await, json!({"type": "subscribe", "payload": {"deviceId": "device_002"}}));
        assert!(timeout(Duration::from_secs(1), server.from_client.recv()).await.is_err());
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fans_out_only_to_matching_entity() {
        let (channel, mut servers, _) = channel();
        let mut a = channel.subscribe("device_001").await;
        let mut b = channel.subscribe("device_001").await;
        channel.connect().await;
        let server = servers.recv().await.unwrap();

        server.push(telemetry("device_002", 1.0)).await;
        server.push(telemetry("device_001", 2.0)).await;

        for sub in [&mut a, &mut b] {
            let sample = sub.recv().await.unwrap();
            assert_eq!(sample.device_id, "device_001");
            assert_eq!(sample.values["temperature"], json!(2.0));
            assert!(timeout(Duration::from_secs(1), sub.recv()).await.is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_arrival_order() {
        let (channel, mut servers, _) = channel();
        let mut sub = channel.subscribe("device_001").await;
        channel.connect().await;
        let server = servers.recv().await.unwrap();

        for value in 0..5 {
            server.push(telemetry("device_001", value as f64)).await;
        }
        for value in 0..5 {
            assert_eq!(sub.recv().await.unwrap().values["temperature"], json!(value as f64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_listener_receives_nothing_more() {
        let (channel, mut servers, _) = channel();
        let mut kept = channel.subscribe("device_001").await;
        let gone = channel.subscribe("device_001").await;
        channel.connect().await;
        let server = servers.recv().await.unwrap();

        channel.unsubscribe(gone);
        assert_eq!(channel.listener_count("device_001"), 1);

        server.push(telemetry("device_001", 3.0)).await;
        assert_eq!(kept.recv().await.unwrap().values["temperature"], json!(3.0));

        drop(kept);
        assert_eq!(channel.listener_count("device_001"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_and_unknown_messages_are_dropped() {
        let (channel, mut servers, _) = channel();
        let mut sub = channel.subscribe("device_001").await;
        channel.connect().await;
        let server = servers.recv().await.unwrap();

        server.to_client.send(Ok("not json".to_string())).await.unwrap();
        server.push(json!({"type": "alarm", "payload": {}})).await;
        server.push(json!({"type": "pong", "payload": {}})).await;
        server.push(json!({"type": "telemetry_update", "payload": {"values": {}}})).await;
        server.push(telemetry("device_001", 4.0)).await;

        assert_eq!(sub.recv().await.unwrap().values["temperature"], json!(4.0));
        assert_eq!(channel.state(), ChannelState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_while_connected() {
        let (channel, mut servers, _) = channel();
        channel.connect().await;
        let mut server = servers.recv().await.unwrap();
        let opened = Instant::now();

        assert_eq!(server.next_message().await, json!({"type": "ping", "payload": {}}));
        assert_around(opened.elapsed(), PING_INTERVAL);
        assert_eq!(server.next_message().await, json!({"type": "ping", "payload": {}}));
        assert_around(opened.elapsed(), PING_INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_close_schedules_one_reconnect() {
        let (channel, mut servers, connector) = channel();
        channel.connect().await;
        let server = servers.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        let closed = Instant::now();
        drop(server);
        wait_for(&channel, ChannelState::Reconnecting).await;
        channel.connect().await;
        channel.connect().await;

        let _server = servers.recv().await.unwrap();
        assert_around(closed.elapsed(), RECONNECT_DELAY);
        wait_for(&channel, ChannelState::Connected).await;

        assert!(timeout(RECONNECT_DELAY * 4, servers.recv()).await.is_err());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_observable() {
        let (channel, mut servers, _) = channel();
        channel.connect().await;
        let server = servers.recv().await.unwrap();

        server.to_client.send(Err(ChannelError::Transport("reset".to_string()))).await.unwrap();
        let status = channel.status().wait_for(|s| s.state == ChannelState::Reconnecting).await.unwrap().clone();
        assert_eq!(status.last_error, Some(ChannelError::Transport("reset".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        let (channel, mut servers, connector) = channel();
        let mut sub = channel.subscribe("device_001").await;
        channel.connect().await;
        drop(servers.recv().await.unwrap());
        wait_for(&channel, ChannelState::Reconnecting).await;

        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(timeout(RECONNECT_DELAY * 4, servers.recv()).await.is_err());
        assert_eq!(connector.attempts(), 1);
        assert!(timeout(Duration::from_secs(1), sub.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_live_connection() {
        let (channel, mut servers, _) = channel();
        channel.connect().await;
        let mut server = servers.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(server.from_client.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connection_is_observable_and_retried_after_delay() {
        let (channel, mut servers, connector) = channel();
        connector.refuse(2);
        let started = Instant::now();

        channel.connect().await;
        let status = channel.status().wait_for(|s| s.state == ChannelState::Reconnecting).await.unwrap().clone();
        assert_eq!(status.last_error, Some(ChannelError::Connect("conexión rechazada".to_string())));
        assert_eq!(connector.attempts(), 1);

        let _server = servers.recv().await.unwrap();
        assert_around(started.elapsed(), RECONNECT_DELAY * 2);
        assert_eq!(connector.attempts(), 3);

        wait_for(&channel, ChannelState::Connected).await;
        assert_eq!(channel.status().borrow().last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn every_close_arms_its_own_single_reconnect() {
        let (channel, mut servers, connector) = channel();
        channel.connect().await;
        let mut server = servers.recv().await.unwrap();
        wait_for(&channel, ChannelState::Connected).await;

        for attempt in 2..=3 {
            let closed = Instant::now();
            drop(server);
            wait_for(&channel, ChannelState::Reconnecting).await;

            server = servers.recv().await.unwrap();
            assert_around(closed.elapsed(), RECONNECT_DELAY);
            assert_eq!(connector.attempts(), attempt);
            wait_for(&channel, ChannelState::Connected).await;
        }

        assert!(timeout(RECONNECT_DELAY * 4, servers.recv()).await.is_err());
        assert_eq!(connector.attempts(), 3);
        drop(server);
    }
}
