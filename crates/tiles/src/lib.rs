//! An asynchronous tile cache and background painting scheduler.
//!
//! Wraps a [`sink_protocol::Producer`] so that pixel requests against a
//! [`OutputHandle`] return immediately with whatever tiles are already
//! painted, while newly-demanded tiles are queued for background
//! computation by a single process-wide [`Scheduler`]. Consumers learn
//! about freshly painted tiles through a [`sink_protocol::Notify`]
//! callback and, optionally, a companion coverage [`MaskHandle`].

mod scheduler;
mod sink;
mod tile;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_support;

use std::sync::Arc;

use sink_protocol::{Notify, Producer, SinkConfig};

pub use scheduler::Scheduler;
pub use sink::{MaskHandle, MaskRegion, OutputHandle, OutputRegion, SinkScreen};

/// Registers a new sink against `scheduler`. `config.max_tiles() == None`
/// means unbounded capacity; `notify.is_some()` selects asynchronous mode
/// (tiles are queued for background paint rather than computed inline).
///
/// The returned `SinkScreen::output` always serves pixels; `SinkScreen::mask`
/// is present only when `with_mask` is `true`. Both share the same
/// underlying tile cache, so a `mask_fill` reflects exactly the tiles a
/// `region_fill` would have returned without triggering any of its own
/// paint work.
pub fn sink_screen(
    scheduler: &Arc<Scheduler>,
    producer: Arc<dyn Producer>,
    config: SinkConfig,
    notify: Option<Arc<dyn Notify>>,
    with_mask: bool,
) -> SinkScreen {
    sink::build_sink(scheduler, producer, config, notify, with_mask)
}
