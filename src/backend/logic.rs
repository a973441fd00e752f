//! Cliente HTTP (reqwest) del backend de telemetría.


use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;
use crate::config::http::CONNECT_TIMEOUT;
use crate::widget::domain::{Sample, WidgetDescriptor};
use super::domain::{ApiEnvelope, BackendError, Device, EntityTelemetry, TelemetryBackend,
                    TimeSeriesData, TimeSeriesRequest, WidgetRecord};


#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
}


impl HttpBackend {

    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        let base_url = Url::parse(base_url)?;

        Ok(Self { client, base_url })
    }

    /// URL de un endpoint bajo la base, conservando su prefijo de ruta.
    ///
    /// Cada segmento se escapa por separado, así un id con `/` o espacios
    /// sigue siendo un único segmento.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Application(format!("URL base sin ruta jerárquica: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Traduce una respuesta al dato útil del sobre `{success, data}`.
    ///
    /// * Estado no 2xx → `Status`.
    /// * JSON ilegible → `Decode`.
    /// * `success: false` o sin `data` → `Application`.
    async fn handle_envelope<T: DeserializeOwned>(&self, response: Response) -> Result<T, BackendError> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BackendError::Status { status: status.as_u16(), message: body });
        }

        let envelope: ApiEnvelope<T> = serde_json::from_str(&body)
            .map_err(|e| BackendError::Decode(e.to_string()))?;

        if !envelope.success {
            return Err(BackendError::Application(
                envelope.error.unwrap_or_else(|| "success=false".to_string())
            ));
        }

        envelope
            .data
            .ok_or_else(|| BackendError::Application("respuesta sin data".to_string()))
    }
}


#[async_trait]
impl TelemetryBackend for HttpBackend {

    #[instrument(skip(self))]
    async fn list_devices(&self) -> Result<Vec<Device>, BackendError> {
        let url = self.endpoint(&["api", "v1", "telemetry", "devices"])?;
        debug!("Debug: listando dispositivos en {}", url);

        let response = self.client.get(url).send().await?;
        self.handle_envelope(response).await
    }

    #[instrument(skip(self, request), fields(device_id = %request.device_id))]
    async fn fetch_timeseries(&self,
                              request: &TimeSeriesRequest) -> Result<HashMap<String, Vec<Sample>>, BackendError> {
        let url = self.endpoint(&["api", "v1", "telemetry", "timeseries"])?;

        let response = self.client.post(url).json(request).send().await?;
        let series: TimeSeriesData = self.handle_envelope(response).await?;
        Ok(series.data)
    }

    #[instrument(skip(self))]
    async fn entity_data(&self, entity_id: &str) -> Result<EntityTelemetry, BackendError> {
        let url = self.endpoint(&["api", "v1", "telemetry", "entities", entity_id, "data"])?;

        let response = self.client.get(url).send().await?;
        self.handle_envelope(response).await
    }

    #[instrument(skip(self))]
    async fn widget_descriptor(&self,
                               bundle_id: &str,
                               widget_id: &str) -> Result<WidgetDescriptor, BackendError> {
        let url = self.endpoint(&["api", "v1", "admin", "widgetsBundles", bundle_id, "widgets", widget_id])?;

        let response = self.client.get(url).send().await?;
        let record: WidgetRecord = self.handle_envelope(response).await?;
        record.into_descriptor(widget_id)
    }
}


#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use tokio::net::TcpListener;
    use super::*;

    async fn serve(router: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        addr
    }

    fn backend(addr: SocketAddr) -> HttpBackend {
        HttpBackend::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn lists_devices() {
        let router = Router::new().route("/api/v1/telemetry/devices", get(|| async {
            Json(json!({"success": true, "data": [
                {"id": "device_001", "name": "Sensor 1", "type": "sensor", "location": "Lab"}
            ]}))
        }));
        let addr = serve(router).await;

        let devices = backend(addr).list_devices().await.unwrap();
        assert_eq!(devices, vec![Device {
            id: "device_001".to_string(),
            name: "Sensor 1".to_string(),
            device_type: "sensor".to_string(),
            location: "Lab".to_string(),
        }]);
    }

    #[tokio::test]
    async fn posts_timeseries_request() {
        let router = Router::new().route("/api/v1/telemetry/timeseries", post(|Json(body): Json<Value>| async move {
            let key = body["keys"][0].as_str().unwrap_or_default().to_string();
            Json(json!({"success": true, "data": {"deviceId": body["deviceId"], "data": {
                key: [[1000.0, 1.5], [61000.0, 2.5]]
            }}}))
        }));
        let addr = serve(router).await;

        let request = TimeSeriesRequest {
            device_id: "device_001".to_string(),
            keys: vec!["temperature".to_string()],
            start_ts: 0,
            end_ts: 61_000,
            interval: 60_000,
        };
        let series = backend(addr).fetch_timeseries(&request).await.unwrap();
        assert_eq!(series["temperature"], vec![Sample(1000, 1.5), Sample(61_000, 2.5)]);
    }

    #[tokio::test]
    async fn maps_failures_to_error_kinds() {
        let router = Router::new()
            .route("/api/v1/telemetry/devices", get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }))
            .route("/api/v1/telemetry/entities/{id}/data", get(|Path(id): Path<String>| async move {
                if id == "broken" {
                    "not json".to_string()
                } else {
                    json!({"success": false, "error": "unknown entity"}).to_string()
                }
            }));
        let addr = serve(router).await;
        let backend = backend(addr);

        assert!(matches!(backend.list_devices().await, Err(BackendError::Status { status: 500, .. })));
        assert!(matches!(backend.entity_data("broken").await, Err(BackendError::Decode(_))));
        assert!(matches!(backend.entity_data("missing").await, Err(BackendError::Application(m)) if m == "unknown entity"));
    }

    #[tokio::test]
    async fn fetches_widget_descriptor() {
        let router = Router::new().route(
            "/api/v1/admin/widgetsBundles/{bundle}/widgets/{widget}",
            get(|Path((_, widget)): Path<(String, String)>| async move {
                Json(json!({"data": {"id": widget, "type": "latest", "descriptor": {
                    "templateHtml": "<tb-led-indicator-widget></tb-led-indicator-widget>",
                    "templateCss": ".led{}",
                    "sizeX": 3,
                    "defaultConfig": "{\"title\":\"LED\"}"
                }}}))
            }),
        );
        let addr = serve(router).await;

        let descriptor = backend(addr).widget_descriptor("bundle", "w-1").await.unwrap();
        assert_eq!(descriptor.id, "w-1");
        assert_eq!(descriptor.declared_type, "latest");
        assert_eq!((descriptor.size_x, descriptor.size_y), (3, 5));
        assert_eq!(descriptor.template_css, ".led{}");
        assert_eq!(descriptor.default_config, "{\"title\":\"LED\"}");
    }

    #[tokio::test]
    async fn keeps_base_path_prefix_and_escapes_ids() {
        let router = Router::new()
            .route("/proxy/api/v1/telemetry/devices", get(|| async {
                Json(json!({"success": true, "data": []}))
            }))
            .route("/proxy/api/v1/telemetry/entities/{id}/data", get(|Path(id): Path<String>| async move {
                Json(json!({"success": true, "data": {"entityId": id, "telemetry": []}}))
            }));
        let addr = serve(router).await;

        for base in [format!("http://{}/proxy", addr), format!("http://{}/proxy/", addr)] {
            let backend = HttpBackend::new(&base, Duration::from_secs(5)).unwrap();
            assert_eq!(backend.list_devices().await.unwrap(), Vec::new());

            let entity = backend.entity_data("sala 2/medidor?x=1").await.unwrap();
            assert_eq!(entity.entity_id, "sala 2/medidor?x=1");
        }
    }

    #[tokio::test]
    async fn endpoint_segments_are_escaped() {
        let backend = HttpBackend::new("http://localhost:8080/base/", Duration::from_secs(5)).unwrap();
        let url = backend.endpoint(&["api", "v1", "telemetry", "entities", "a b/c#d", "data"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/base/api/v1/telemetry/entities/a%20b%2Fc%23d/data");
    }

    #[tokio::test]
    async fn rejects_base_urls_without_a_path() {
        let backend = HttpBackend::new("mailto:ops@example.com", Duration::from_secs(5)).unwrap();
        assert!(matches!(backend.endpoint(&["api"]), Err(BackendError::Application(_))));
    }
}
