//! Per-camera frame hand-off between the producer and its consumers

pub mod double_buffer;
pub mod ringbuf;

use std::sync::atomic::{AtomicBool, Ordering};

pub use double_buffer::DoubleBuffer;
pub use self::ringbuf::{BoundedQueue, QueueStats};

use crate::capture::Frame;

/// Queues feeding the overlay compositor and, from it, the recorder
pub struct OverlayFrameInfo {
    /// Raw frames awaiting overlay render
    pub original: BoundedQueue<Frame>,
    /// Composited frames awaiting the recorder
    pub overlay: BoundedQueue<Frame>,
}

/// Everything one producer shares with the consumers of its camera.
///
/// The three slots always hold the latest frame. The queues are only fed
/// while a consumer has enabled them.
pub struct CameraSlots {
    pub display: DoubleBuffer<Frame>,
    pub stream: DoubleBuffer<Frame>,
    pub record: DoubleBuffer<Frame>,
    pub record_queue: BoundedQueue<Frame>,
    pub overlay: OverlayFrameInfo,
    recording: AtomicBool,
    overlay_active: AtomicBool,
}

impl CameraSlots {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            display: DoubleBuffer::new(),
            stream: DoubleBuffer::new(),
            record: DoubleBuffer::new(),
            record_queue: BoundedQueue::new(queue_depth),
            overlay: OverlayFrameInfo {
                original: BoundedQueue::new(queue_depth),
                overlay: BoundedQueue::new(queue_depth),
            },
            recording: AtomicBool::new(false),
            overlay_active: AtomicBool::new(false),
        }
    }

    /// Fan a freshly captured frame out to every slot and enabled queue.
    /// Only the frame handle is cloned; pixel data is shared and immutable.
    pub fn publish(&self, frame: Frame) {
        self.display.write(frame.clone());
        self.stream.write(frame.clone());
        self.record.write(frame.clone());
        if self.recording.load(Ordering::Acquire) {
            self.record_queue.push(frame.clone());
        }
        if self.overlay_active.load(Ordering::Acquire) {
            self.overlay.original.push(frame);
        }
    }

    pub fn set_recording(&self, enabled: bool) {
        if !self.recording.swap(enabled, Ordering::AcqRel) && enabled {
            self.record_queue.clear();
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_overlay_active(&self, enabled: bool) {
        self.overlay_active.store(enabled, Ordering::Release);
        if !enabled {
            self.overlay.original.clear();
            self.overlay.overlay.clear();
        }
    }

    pub fn overlay_active(&self) -> bool {
        self.overlay_active.load(Ordering::Acquire)
    }

    /// Frames evicted from the consumer queues since creation
    pub fn dropped_frames(&self) -> u64 {
        self.record_queue.stats().dropped
            + self.overlay.original.stats().dropped
            + self.overlay.overlay.stats().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_frame;

    #[test]
    fn test_publish_fills_slots_only_when_idle() {
        let slots = CameraSlots::new(3);
        slots.publish(test_frame(1, 4, 4));
        assert_eq!(slots.display.read().unwrap().meta.sequence, 1);
        assert_eq!(slots.stream.read().unwrap().meta.sequence, 1);
        assert_eq!(slots.record.read().unwrap().meta.sequence, 1);
        assert!(slots.record_queue.is_empty());
        assert!(slots.overlay.original.is_empty());
    }

    #[test]
    fn test_queues_bounded_with_oldest_drop() {
        let slots = CameraSlots::new(3);
        slots.set_recording(true);
        slots.set_overlay_active(true);
        for seq in 1..=5 {
            slots.publish(test_frame(seq, 4, 4));
        }
        let recorded: Vec<u64> = std::iter::from_fn(|| slots.record_queue.pop())
            .map(|f| f.meta.sequence)
            .collect();
        assert_eq!(recorded, vec![3, 4, 5]);
        assert_eq!(slots.overlay.original.len(), 3);
        assert_eq!(slots.dropped_frames(), 4);
    }

    #[test]
    fn test_enabling_recording_discards_stale_frames() {
        let slots = CameraSlots::new(3);
        slots.set_recording(true);
        slots.publish(test_frame(1, 2, 2));
        slots.set_recording(false);
        slots.set_recording(true);
        assert!(slots.record_queue.is_empty());
    }
}
