use crate::channels::domain::Channels;
use crate::context::domain::AppContext;
use crate::dashboard::logic::{ctrl_c, run_session};
use crate::system::domain::{init_tracing, System};
use tracing::error;

mod backend;
mod channels;
mod config;
mod context;
mod dashboard;
mod datasource;
mod realtime;
mod system;
mod widget;


#[tokio::main]
async fn main() {

    let system = match System::new() {
        Ok(system) => system,
        Err(e) => {
            eprintln!("Configuración inválida: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&system);

    let app_context = match AppContext::new(system) {
        Ok(app_context) => app_context,
        Err(e) => {
            error!("Error: no se pudo crear el contexto: {}", e);
            std::process::exit(1);
        }
    };

    let channels = Channels::new();

    if let Err(e) = run_session(app_context,
                                channels.widget_to_display,
                                channels.display_from_widget,
                                ctrl_c()).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}
