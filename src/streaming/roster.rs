use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A remote participant subscribed to the broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub id: u32,
    pub display_name: Option<String>,
    pub is_speaking: bool,
    pub is_streaming_video: bool,
}

impl Viewer {
    fn joined(id: u32) -> Self {
        Self {
            id,
            display_name: None,
            is_speaking: false,
            is_streaming_video: false,
        }
    }
}

/// Aggregate count plus the viewer that changed (`None` on leave)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerUpdate {
    pub count: usize,
    pub viewer: Option<Viewer>,
}

/// Live set of viewers. The count is always the number of entries.
#[derive(Debug, Default)]
pub struct ViewerRoster {
    viewers: BTreeMap<u32, Viewer>,
}

impl ViewerRoster {
    pub fn join(&mut self, id: u32) -> ViewerUpdate {
        let viewer = Viewer::joined(id);
        self.viewers.insert(id, viewer.clone());
        self.update(Some(viewer))
    }

    /// Unknown ids are ignored
    pub fn leave(&mut self, id: u32) -> Option<ViewerUpdate> {
        self.viewers.remove(&id)?;
        Some(self.update(None))
    }

    pub fn set_speaking(&mut self, id: u32, speaking: bool) -> Option<ViewerUpdate> {
        let viewer = self.viewers.get_mut(&id)?;
        viewer.is_speaking = speaking;
        let viewer = viewer.clone();
        Some(self.update(Some(viewer)))
    }

    pub fn set_streaming_video(&mut self, id: u32, streaming: bool) -> Option<ViewerUpdate> {
        let viewer = self.viewers.get_mut(&id)?;
        viewer.is_streaming_video = streaming;
        let viewer = viewer.clone();
        Some(self.update(Some(viewer)))
    }

    pub fn clear(&mut self) {
        self.viewers.clear();
    }

    pub fn count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewers(&self) -> Vec<Viewer> {
        self.viewers.values().cloned().collect()
    }

    fn update(&self, viewer: Option<Viewer>) -> ViewerUpdate {
        ViewerUpdate {
            count: self.count(),
            viewer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_track_count() {
        let mut roster = ViewerRoster::default();
        assert_eq!(roster.join(7).count, 1);
        assert_eq!(roster.join(9).count, 2);

        let update = roster.leave(7).unwrap();
        assert_eq!(update, ViewerUpdate { count: 1, viewer: None });
    }

    #[test]
    fn unknown_leave_is_a_no_op() {
        let mut roster = ViewerRoster::default();
        roster.join(1);
        assert!(roster.leave(42).is_none());
        assert_eq!(roster.count(), 1);

        roster.clear();
        assert!(roster.leave(1).is_none());
        assert_eq!(roster.count(), 0);
    }

    #[test]
    fn rejoin_does_not_double_count() {
        let mut roster = ViewerRoster::default();
        roster.join(3);
        assert_eq!(roster.join(3).count, 1);
    }

    #[test]
    fn media_state_updates_the_viewer() {
        let mut roster = ViewerRoster::default();
        roster.join(5);

        let update = roster.set_speaking(5, true).unwrap();
        assert!(update.viewer.as_ref().is_some_and(|v| v.is_speaking));

        let update = roster.set_streaming_video(5, true).unwrap();
        let viewer = update.viewer.unwrap();
        assert!(viewer.is_speaking && viewer.is_streaming_video);

        assert!(roster.set_speaking(6, true).is_none());
    }
}
