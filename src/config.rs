//! Constantes operativas fijas del protocolo y de la resolución de widgets.


pub mod realtime {
    use tokio::time::Duration;

    /// Espera fija antes de cada intento de reconexión.
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);
    /// Periodo del mensaje `ping` mientras el canal está conectado.
    pub const PING_INTERVAL: Duration = Duration::from_millis(30_000);
    pub const OUTBOUND_BUFFER: usize = 100;
    pub const COMMAND_BUFFER: usize = 64;
}


pub mod datasource {
    pub const MOCK_SAMPLE_COUNT: usize = 50;
    pub const MOCK_SAMPLE_INTERVAL_MS: i64 = 60_000;
    /// Los valores aleatorios se distribuyen uniformemente en `[-MOCK_AMPLITUDE, MOCK_AMPLITUDE)`.
    pub const MOCK_AMPLITUDE: f64 = 50.0;
    pub const FETCH_WINDOW_MS: i64 = 3_600_000;
    pub const FETCH_INTERVAL_MS: i64 = 60_000;
    pub const EXPRESSION_STEP_BUDGET: usize = 10_000;
    /// Anidamiento máximo de paréntesis, operadores unarios, llamadas e `if`.
    pub const EXPRESSION_MAX_DEPTH: usize = 64;
    /// Longitud máxima de un `funcBody`; acota también la profundidad de las cadenas binarias.
    pub const EXPRESSION_MAX_SOURCE_LEN: usize = 2048;
}


pub mod http {
    use tokio::time::Duration;

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}


pub mod dashboard {
    pub const DEFAULT_SIZE_X: u32 = 8;
    pub const DEFAULT_SIZE_Y: u32 = 5;
    pub const DEFAULT_WIDGET_TYPE: &str = "timeseries";
    /// Entidad de tiempo real cuando un widget en vivo no declara ninguna.
    pub const DEFAULT_REALTIME_DEVICE: &str = "device_001";
    pub const DEFAULT_POWER_METER: &str = "power_meter";
    pub const PANEL_EVENT_BUFFER: usize = 200;
    pub const DEFAULT_BUNDLE_ID: &str = "b1b8b378-bf74-498d-9306-17bab2abc5bb";
    pub const DEFAULT_WIDGET_IDS: [&str; 3] = [
        "92c7bfd0-6bcc-4918-8728-9ccd1ca8c0d4",
        "90142b78-e8d1-43a3-b541-64f2316dcd19",
        "dcf38bc4-4a02-4373-8165-348637be64c0",
    ];
}
