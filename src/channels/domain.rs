use tokio::sync::mpsc;
use crate::config::dashboard::PANEL_EVENT_BUFFER;
use crate::dashboard::domain::PanelEvent;


pub struct Channels {
    pub widget_to_display: mpsc::Sender<PanelEvent>,
    pub display_from_widget: mpsc::Receiver<PanelEvent>,
}


impl Channels {
    pub fn new() -> Channels {
        let (w_to_d, d_from_w) = mpsc::channel::<PanelEvent>(PANEL_EVENT_BUFFER);

        Self {
            widget_to_display: w_to_d,
            display_from_widget: d_from_w,
        }
    }
}
