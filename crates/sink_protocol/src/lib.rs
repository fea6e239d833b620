//! Types at the boundary between a sink and its collaborators: the
//! producer a sink paints from, the notification callback a sink paints
//! into, and the configuration a sink is constructed with.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use model::{PixelLayout, Rect, SizeOverflow};

/// Opaque, process-wide unique identity for a sink. Used only for log
/// correlation and test assertions; carries no ordering guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl SinkId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SinkId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sink#{}", self.0)
    }
}

/// Validated construction parameters for a sink. Mirrors `sink_screen`'s
/// parameter list; invalid combinations are rejected here rather than deep
/// inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    tile_width: u32,
    tile_height: u32,
    max_tiles: i64,
    priority: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkConfigError {
    ZeroTileWidth,
    ZeroTileHeight,
    InvalidMaxTiles(i64),
}

impl fmt::Display for SinkConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkConfigError::ZeroTileWidth => write!(f, "tile_width must be greater than zero"),
            SinkConfigError::ZeroTileHeight => write!(f, "tile_height must be greater than zero"),
            SinkConfigError::InvalidMaxTiles(value) => {
                write!(f, "max_tiles must be -1 (unbounded) or >= 0, got {value}")
            }
        }
    }
}

impl std::error::Error for SinkConfigError {}

impl SinkConfig {
    pub fn new(
        tile_width: u32,
        tile_height: u32,
        max_tiles: i64,
        priority: i64,
    ) -> Result<Self, SinkConfigError> {
        if tile_width == 0 {
            return Err(SinkConfigError::ZeroTileWidth);
        }
        if tile_height == 0 {
            return Err(SinkConfigError::ZeroTileHeight);
        }
        if max_tiles < -1 {
            return Err(SinkConfigError::InvalidMaxTiles(max_tiles));
        }
        Ok(Self {
            tile_width,
            tile_height,
            max_tiles,
            priority,
        })
    }

    pub fn tile_width(&self) -> u32 {
        self.tile_width
    }

    pub fn tile_height(&self) -> u32 {
        self.tile_height
    }

    /// `None` means unbounded (`max_tiles == -1`).
    pub fn max_tiles(&self) -> Option<u32> {
        (self.max_tiles != -1).then_some(self.max_tiles as u32)
    }

    pub fn priority(&self) -> i64 {
        self.priority
    }
}

/// Error surfaced by a producer's `prepare` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareError {
    pub message: String,
}

impl PrepareError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prepare failed: {}", self.message)
    }
}

impl std::error::Error for PrepareError {}

/// The upstream pixel source a sink paints from. Out of scope for this
/// crate beyond this interface: the producer itself decides how a
/// rectangle is computed.
pub trait Producer: Send + Sync {
    /// Pixel layout of every region this producer prepares into.
    fn pixel_layout(&self) -> PixelLayout;

    /// Compute pixels for `rect` into `region`, a buffer already sized by
    /// `pixel_layout().buffer_bytes(rect.width, rect.height)`.
    fn prepare(&self, rect: Rect, region: &mut [u8]) -> Result<(), PrepareError>;
}

/// Callback invoked from a worker thread when a tile transitions to
/// painted. Implementations must be thread-safe; a typical implementation
/// marshals the notice onto a UI thread rather than acting on it directly.
pub trait Notify: Send + Sync {
    fn on_tile_painted(&self, area: Rect);
}

/// Top-level error returned from sink construction and from the request
/// path.
#[derive(Debug)]
pub enum SinkError {
    Config(SinkConfigError),
    Prepare(PrepareError),
    SizeOverflow(SizeOverflow),
    ThreadSpawn(std::io::Error),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkError::Config(e) => write!(f, "invalid sink configuration: {e}"),
            SinkError::Prepare(e) => write!(f, "{e}"),
            SinkError::SizeOverflow(e) => write!(f, "{e}"),
            SinkError::ThreadSpawn(e) => write!(f, "failed to start sink worker thread: {e}"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Config(e) => Some(e),
            SinkError::Prepare(e) => Some(e),
            SinkError::SizeOverflow(e) => Some(e),
            SinkError::ThreadSpawn(e) => Some(e),
        }
    }
}

impl From<SinkConfigError> for SinkError {
    fn from(e: SinkConfigError) -> Self {
        SinkError::Config(e)
    }
}

impl From<PrepareError> for SinkError {
    fn from(e: PrepareError) -> Self {
        SinkError::Prepare(e)
    }
}

impl From<SizeOverflow> for SinkError {
    fn from(e: SizeOverflow) -> Self {
        SinkError::SizeOverflow(e)
    }
}
