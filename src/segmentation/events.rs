//! Segmentation change notifications
//!
//! Observers call [`Segmentation::subscribe`](super::Segmentation::subscribe)
//! and receive [`SegmentationEvent`]s over a channel. Inside a modify batch,
//! master and representation notifications are held back and delivered once
//! when the outermost batch ends.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Observable change of a segmentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentationEvent {
    /// Master representation content or name changed; non-master
    /// representations were dropped
    MasterRepresentationModified { segment_ids: Vec<String> },
    RepresentationModified { segment_id: String },
    SegmentAdded { segment_id: String },
    SegmentRemoved { segment_id: String },
    /// Name, color, tags or label value changed
    SegmentModified { segment_id: String },
    ContainedRepresentationNamesModified,
    SegmentsOrderModified,
}

/// Subscriber list plus the batch counter
#[derive(Debug, Default)]
pub(crate) struct EventHub {
    subscribers: Vec<Sender<SegmentationEvent>>,
    depth: u32,
    pending_master: Vec<String>,
    pending_master_raised: bool,
    pending_representation: Vec<String>,
}

impl EventHub {
    pub fn subscribe(&mut self) -> Receiver<SegmentationEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.push(sender);
        receiver
    }

    pub fn is_batching(&self) -> bool {
        self.depth > 0
    }

    pub fn start(&mut self) {
        self.depth += 1;
    }

    /// Leave one batch level, flushing queued events at the outermost level
    pub fn end(&mut self) {
        if self.depth == 0 {
            return;
        }
        self.depth -= 1;
        if self.depth == 0 {
            self.flush();
        }
    }

    pub fn emit(&mut self, event: SegmentationEvent) {
        if self.depth > 0 {
            match event {
                SegmentationEvent::MasterRepresentationModified { segment_ids } => {
                    self.pending_master_raised = true;
                    for id in segment_ids {
                        if !self.pending_master.contains(&id) {
                            self.pending_master.push(id);
                        }
                    }
                    return;
                }
                SegmentationEvent::RepresentationModified { segment_id } => {
                    if !self.pending_representation.contains(&segment_id) {
                        self.pending_representation.push(segment_id);
                    }
                    return;
                }
                other => return self.send(other),
            }
        }
        self.send(event);
    }

    fn flush(&mut self) {
        if std::mem::take(&mut self.pending_master_raised) {
            let segment_ids = std::mem::take(&mut self.pending_master);
            self.send(SegmentationEvent::MasterRepresentationModified { segment_ids });
        }
        for segment_id in std::mem::take(&mut self.pending_representation) {
            self.send(SegmentationEvent::RepresentationModified { segment_id });
        }
    }

    fn send(&mut self, event: SegmentationEvent) {
        trace!(?event, "Segmentation event");
        // Disconnected receivers are dropped
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}
