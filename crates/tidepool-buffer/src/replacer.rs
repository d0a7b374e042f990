//! Page replacement policies for the buffer pool.

use crate::frame::FrameId;
use crate::lru::LruReplacer;
use parking_lot::Mutex;
use tidepool_common::ReplacerKind;
use tracing::error;

/// Trait for page replacement algorithms.
///
/// Each method is atomic on its own and never calls back into the pool, so
/// it is safe to invoke while the pool latch is held.
pub trait Replacer: Send + Sync {
    /// Selects a victim frame and stops tracking it.
    ///
    /// Returns None if no frames are evictable.
    fn victim(&self) -> Option<FrameId>;

    /// Marks a frame as in use, excluding it from victim selection.
    fn pin(&self, frame_id: FrameId);

    /// Marks a frame as evictable.
    fn unpin(&self, frame_id: FrameId);

    /// Stops tracking a frame regardless of its position in the policy.
    fn remove(&self, frame_id: FrameId);

    /// Returns the number of evictable frames.
    fn size(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    /// Not tracked: never unpinned, victimized, or removed.
    Invalid,
    Pinned,
    Evictable,
}

/// Clock (second-chance) replacement algorithm.
///
/// Frames sit on a circular buffer with a use bit each. Unpinning or pinning
/// a frame sets its use bit. When selecting a victim the hand sweeps forward:
/// an evictable frame with its use bit set has the bit cleared and is passed
/// over; the first evictable frame with a clear bit is chosen. The sweep gives
/// up after two full turns.
pub struct ClockReplacer {
    /// Internal state protected by mutex.
    inner: Mutex<ClockReplacerInner>,
}

struct ClockReplacerInner {
    /// Per-frame tracking state.
    states: Vec<FrameState>,
    /// Use (reference) bits for each frame.
    use_bits: Vec<bool>,
    /// Number of frames in `Evictable` state.
    evictable: usize,
    /// Current clock hand position.
    clock_hand: usize,
}

impl ClockReplacer {
    /// Creates a new clock replacer with the given number of frames.
    pub fn new(num_frames: usize) -> Self {
        Self {
            inner: Mutex::new(ClockReplacerInner {
                states: vec![FrameState::Invalid; num_frames],
                use_bits: vec![false; num_frames],
                evictable: 0,
                clock_hand: 0,
            }),
        }
    }

    /// Returns the total capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().states.len()
    }
}

impl Replacer for ClockReplacer {
    fn victim(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.evictable == 0 {
            return None;
        }

        let num_frames = inner.states.len();
        for _ in 0..(2 * num_frames) {
            let hand = inner.clock_hand;
            inner.clock_hand = (hand + 1) % num_frames;

            if inner.states[hand] != FrameState::Evictable {
                continue;
            }
            if inner.use_bits[hand] {
                // Second chance
                inner.use_bits[hand] = false;
                continue;
            }

            inner.states[hand] = FrameState::Invalid;
            inner.evictable -= 1;
            return Some(FrameId(hand as u32));
        }

        None
    }

    fn pin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.index();
        if idx >= inner.states.len() {
            return;
        }

        match inner.states[idx] {
            FrameState::Invalid => return,
            FrameState::Evictable => {
                inner.evictable -= 1;
                inner.states[idx] = FrameState::Pinned;
            }
            FrameState::Pinned => {}
        }
        inner.use_bits[idx] = true;
    }

    fn unpin(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.index();
        if idx >= inner.states.len() {
            return;
        }

        if inner.states[idx] != FrameState::Evictable {
            inner.states[idx] = FrameState::Evictable;
            inner.evictable += 1;
        }
        inner.use_bits[idx] = true;
    }

    /// # Panics
    ///
    /// Panics if the frame is pinned. Removing a pinned frame means the pool
    /// lost track of a user and is not recoverable.
    fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();
        let idx = frame_id.index();
        if idx >= inner.states.len() {
            return;
        }

        match inner.states[idx] {
            FrameState::Invalid => {}
            FrameState::Pinned => {
                error!(frame_id = %frame_id, "attempted to remove a pinned frame from the clock replacer");
                panic!("cannot remove pinned {frame_id} from the clock replacer");
            }
            FrameState::Evictable => {
                inner.states[idx] = FrameState::Invalid;
                inner.use_bits[idx] = false;
                inner.evictable -= 1;
            }
        }
    }

    fn size(&self) -> usize {
        self.inner.lock().evictable
    }
}

/// The replacement policy chosen at pool construction.
pub enum AnyReplacer {
    Clock(ClockReplacer),
    Lru(LruReplacer),
}

impl AnyReplacer {
    /// Builds the policy named by `kind` for `num_frames` frames.
    pub fn new(kind: ReplacerKind, num_frames: usize) -> Self {
        match kind {
            ReplacerKind::Clock => AnyReplacer::Clock(ClockReplacer::new(num_frames)),
            ReplacerKind::Lru => AnyReplacer::Lru(LruReplacer::new(num_frames)),
        }
    }

    /// Returns which policy this is.
    pub fn kind(&self) -> ReplacerKind {
        match self {
            AnyReplacer::Clock(_) => ReplacerKind::Clock,
            AnyReplacer::Lru(_) => ReplacerKind::Lru,
        }
    }
}

impl Replacer for AnyReplacer {
    fn victim(&self) -> Option<FrameId> {
        match self {
            AnyReplacer::Clock(r) => r.victim(),
            AnyReplacer::Lru(r) => r.victim(),
        }
    }

    fn pin(&self, frame_id: FrameId) {
        match self {
            AnyReplacer::Clock(r) => r.pin(frame_id),
            AnyReplacer::Lru(r) => r.pin(frame_id),
        }
    }

    fn unpin(&self, frame_id: FrameId) {
        match self {
            AnyReplacer::Clock(r) => r.unpin(frame_id),
            AnyReplacer::Lru(r) => r.unpin(frame_id),
        }
    }

    fn remove(&self, frame_id: FrameId) {
        match self {
            AnyReplacer::Clock(r) => r.remove(frame_id),
            AnyReplacer::Lru(r) => r.remove(frame_id),
        }
    }

    fn size(&self) -> usize {
        match self {
            AnyReplacer::Clock(r) => r.size(),
            AnyReplacer::Lru(r) => r.size(),
        }
    }
}

impl std::fmt::Debug for AnyReplacer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyReplacer")
            .field("kind", &self.kind())
            .field("size", &self.size())
            .finish()
    }
}
