use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use crate::config::realtime::OUTBOUND_BUFFER;
use super::domain::{ChannelError, Connection, Connector};


/// Conexión WebSocket real contra el servidor de telemetría.
pub struct WsConnector {
    url: Url,
}


impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}


#[async_trait]
impl Connector for WsConnector {

    async fn connect(&self) -> Result<Connection, ChannelError> {

        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        info!("Info: WebSocket abierto en {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (tx_outbound, mut rx_outbound) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let (tx_inbound, rx_inbound) = mpsc::channel(OUTBOUND_BUFFER);

        // Escritura: termina cuando el canal suelta la conexión.
        tokio::spawn(async move {
            while let Some(text) = rx_outbound.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("Warning: no se pudo escribir en el WebSocket: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Lectura
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let forwarded = match frame {
                    Ok(Message::Text(text)) => tx_inbound.send(Ok(text.as_str().to_owned())).await,
                    Ok(Message::Close(reason)) => {
                        debug!("Debug: cierre recibido {:?}", reason);
                        break;
                    }
                    Ok(_) => Ok(()),
                    Err(e) => {
                        let _ = tx_inbound.send(Err(ChannelError::Transport(e.to_string()))).await;
                        break;
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
        });

        Ok(Connection { outbound: tx_outbound, inbound: rx_inbound })
    }
}


#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use super::*;

    #[tokio::test]
    async fn relays_frames_in_both_directions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            ws.send(Message::Text("hola".into())).await.unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text.as_str().to_owned(),
                    Some(Ok(_)) => continue,
                    other => panic!("frame inesperado: {other:?}"),
                }
            };
            ws.close(None).await.unwrap();
            received
        });

        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let mut connection = WsConnector::new(url).connect().await.unwrap();

        assert_eq!(connection.inbound.recv().await.unwrap().unwrap(), "hola");
        connection.outbound.send("chau".to_string()).await.unwrap();
        assert_eq!(server.await.unwrap(), "chau");
        assert!(connection.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let result = WsConnector::new(url).connect().await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }
}
