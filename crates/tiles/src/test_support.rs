//! Lightweight producer and notify stand-ins used by this crate's own
//! tests in place of a real pixel pipeline. Exposed behind the
//! `test-helpers` feature so downstream crates can reuse them rather than
//! hand-rolling another fake producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::Arc;
use std::time::Duration;

use model::{PixelLayout, Rect};
use sink_protocol::{Notify, PrepareError, Producer};

/// Deterministic, optionally-slow, optionally-failing producer. Fills each
/// pixel with a value derived from its image-space coordinates so tests
/// can assert on content without needing a real image pipeline.
pub struct TestProducer {
    pixel_layout: PixelLayout,
    delay: Duration,
    fail_next: AtomicBool,
}

impl TestProducer {
    pub fn new(bytes_per_pixel: u32) -> Self {
        Self {
            pixel_layout: PixelLayout { bytes_per_pixel },
            delay: Duration::ZERO,
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// The next `prepare` call fails; after that, prepare succeeds again.
    pub fn force_next_failure(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Producer for TestProducer {
    fn pixel_layout(&self) -> PixelLayout {
        self.pixel_layout
    }

    fn prepare(&self, rect: Rect, region: &mut [u8]) -> Result<(), PrepareError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PrepareError::new("forced test failure"));
        }
        let bpp = self.pixel_layout.bytes_per_pixel as usize;
        for y in 0..rect.height as i64 {
            for x in 0..rect.width as i64 {
                let value = ((rect.left + x) ^ (rect.top + y)) as u8;
                let index = (y as usize * rect.width as usize + x as usize) * bpp;
                region[index..index + bpp].fill(value);
            }
        }
        Ok(())
    }
}

/// Records every painted area it is told about onto a channel a test can
/// drain with a timeout.
pub struct RecordingNotify {
    sender: Sender<Rect>,
}

impl Notify for RecordingNotify {
    fn on_tile_painted(&self, area: Rect) {
        // The test side may have stopped listening; a disconnected
        // receiver is not this callback's problem to report.
        let _ = self.sender.send(area);
    }
}

pub struct NotifyRecorder {
    pub receiver: Receiver<Rect>,
}

pub fn recording_notify() -> (Arc<RecordingNotify>, NotifyRecorder) {
    let (sender, receiver) = channel();
    (Arc::new(RecordingNotify { sender }), NotifyRecorder { receiver })
}
