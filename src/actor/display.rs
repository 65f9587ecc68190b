use flume::Receiver;
use serde::Serialize;
use tracing::{info, warn};

use crate::camera::DeviceSelectionContext;
use crate::events::Event;
use crate::streaming::{QualityPreset, Viewer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub channel_id: String,
    pub viewer_url: String,
    pub quality: QualityPreset,
}

/// What the UI shows, rebuilt purely from the event stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DisplayState {
    pub camera_ready: bool,
    pub devices: Vec<String>,
    pub context: Option<DeviceSelectionContext>,
    pub stream: Option<StreamStatus>,
    pub viewer_count: usize,
    /// Last viewer that joined or changed media state
    pub last_viewer: Option<Viewer>,
    pub last_error: Option<String>,
    pub last_still: Option<(u32, u32)>,
}

impl DisplayState {
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::CameraReady { devices, context } => {
                self.camera_ready = true;
                self.devices = devices.clone();
                self.context = Some(*context);
            }
            Event::CameraError { message, .. } | Event::StreamError { message } => {
                self.last_error = Some(message.clone());
            }
            Event::StillCaptured { image } => {
                self.last_still = Some((image.width, image.height));
            }
            Event::StreamStarted {
                channel_id,
                viewer_url,
                quality,
            } => {
                self.stream = Some(StreamStatus {
                    channel_id: channel_id.clone(),
                    viewer_url: viewer_url.clone(),
                    quality: *quality,
                });
                self.viewer_count = 0;
                self.last_viewer = None;
            }
            Event::StreamStopped { .. } => {
                self.stream = None;
                self.viewer_count = 0;
                self.last_viewer = None;
            }
            Event::ViewerUpdate { count, viewer } => {
                self.viewer_count = *count;
                if viewer.is_some() {
                    self.last_viewer = viewer.clone();
                }
            }
            Event::QualityChanged { quality } => {
                if let Some(stream) = &mut self.stream {
                    stream.quality = *quality;
                }
            }
        }
    }
}

/// UI side of the channel pair
#[derive(Default)]
pub struct DisplayActor {
    state: DisplayState,
}

impl DisplayActor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DisplayState {
        &self.state
    }

    /// Fold events until the host side hangs up, returning the final state
    pub async fn run(mut self, events: Receiver<Event>) -> DisplayState {
        while let Ok(event) = events.recv_async().await {
            match &event {
                Event::CameraError { message, .. } | Event::StreamError { message } => {
                    warn!(%message, "Host reported an error")
                }
                Event::StreamStarted { viewer_url, .. } => info!(%viewer_url, "Live"),
                Event::ViewerUpdate { count, .. } => info!(count, "Viewers"),
                _ => info!(?event, "Host event"),
            }
            self.state.apply(&event);
        }
        self.state
    }
}
