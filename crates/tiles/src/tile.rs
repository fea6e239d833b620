use model::Rect;

/// A single cache cell. Owned exclusively by the `Sink` it lives in;
/// `Sink` never hands out a reference that can outlive its own lock.
#[derive(Debug)]
pub(crate) struct Tile {
    pub area: Rect,
    pub region: Vec<u8>,
    pub painted: bool,
    pub invalid: bool,
    pub ticks: u64,
}

impl Tile {
    pub(crate) fn new(area: Rect, ticks: u64) -> Self {
        Self {
            area,
            region: Vec::new(),
            painted: false,
            invalid: false,
            ticks,
        }
    }

    pub(crate) fn is_usable(&self) -> bool {
        self.painted && !self.invalid
    }
}
