use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::common::{FrameId, Timestamp};

/// Tracks access history for a single frame
#[derive(Debug)]
struct FrameAccessInfo {
    /// History of access timestamps (most recent at back)
    history: VecDeque<Timestamp>,
    /// Whether this frame is currently evictable
    is_evictable: bool,
}

impl FrameAccessInfo {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    /// Records an access at the given timestamp, keeping only the last k.
    fn record_access(&mut self, timestamp: Timestamp, k: usize) {
        self.history.push_back(timestamp);
        while self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Returns the backward k-distance from the current timestamp.
    /// Returns None if this frame has fewer than k accesses (+inf distance).
    fn k_distance(&self, current_timestamp: Timestamp, k: usize) -> Option<Timestamp> {
        if self.history.len() < k {
            None
        } else {
            // The kth most recent access sits at index (len - k)
            Some(current_timestamp - self.history[self.history.len() - k])
        }
    }

    /// Returns the earliest timestamp still in the window.
    fn earliest_timestamp(&self) -> Option<Timestamp> {
        self.history.front().copied()
    }
}

/// State behind the replacer's single mutex.
struct ReplacerInner {
    /// Access information for each tracked frame
    frame_info: HashMap<FrameId, FrameAccessInfo>,
    /// Number of evictable frames
    num_evictable: usize,
    /// Monotonically increasing access counter
    current_timestamp: Timestamp,
}

/// LRU-K Replacement Policy
///
/// The LRU-K algorithm evicts the frame whose backward k-distance is the
/// maximum over all evictable frames. Backward k-distance is the difference
/// between the current timestamp and the timestamp of the kth most recent
/// access.
///
/// A frame with fewer than k historical accesses has +inf backward
/// k-distance. When multiple frames tie at +inf, the replacer evicts the
/// frame with the earliest remaining timestamp.
pub struct LruKReplacer {
    /// K value for the LRU-K algorithm
    k: usize,
    /// Maximum number of frames the replacer can track
    max_frames: usize,
    /// All replacer state sits behind one mutex; operations are short.
    inner: Mutex<ReplacerInner>,
}

impl LruKReplacer {
    /// Creates a new LRU-K replacer with the given k value and maximum frame count.
    pub fn new(k: usize, max_frames: usize) -> Self {
        Self {
            k,
            max_frames,
            inner: Mutex::new(ReplacerInner {
                frame_info: HashMap::new(),
                num_evictable: 0,
                current_timestamp: 0,
            }),
        }
    }

    /// Evicts the frame with the largest backward k-distance, removing all
    /// of its metadata. Returns None if there are no evictable frames.
    pub fn evict(&self) -> Option<FrameId> {
        let mut inner = self.inner.lock();

        if inner.num_evictable == 0 {
            return None;
        }

        let current_ts = inner.current_timestamp;

        let mut victim: Option<FrameId> = None;
        let mut victim_k_dist: Option<Timestamp> = None;
        let mut victim_earliest_ts: Option<Timestamp> = None;

        for (frame_id, info) in inner.frame_info.iter() {
            if !info.is_evictable {
                continue;
            }

            let k_dist = info.k_distance(current_ts, self.k);
            let earliest_ts = info.earliest_timestamp();

            let should_replace = match (victim_k_dist, k_dist) {
                // Candidate has finite distance, victim is +inf: keep victim
                (None, Some(_)) => false,
                // Candidate is +inf, victim finite: take candidate
                (Some(_), None) => true,
                // Both +inf: earlier remaining timestamp wins
                (None, None) => match (victim_earliest_ts, earliest_ts) {
                    (Some(v_ts), Some(c_ts)) => c_ts < v_ts,
                    (None, Some(_)) => true,
                    _ => false,
                },
                // Both finite: larger distance wins, ties to earlier timestamp
                (Some(v_dist), Some(c_dist)) => {
                    c_dist > v_dist || (c_dist == v_dist && earliest_ts < victim_earliest_ts)
                }
            };

            if victim.is_none() || should_replace {
                victim = Some(*frame_id);
                victim_k_dist = k_dist;
                victim_earliest_ts = earliest_ts;
            }
        }

        if let Some(frame_id) = victim {
            inner.frame_info.remove(&frame_id);
            inner.num_evictable -= 1;
        }

        victim
    }

    /// Records that the given frame was accessed at the current timestamp.
    pub fn record_access(&self, frame_id: FrameId) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut inner = self.inner.lock();
        let timestamp = inner.current_timestamp;
        inner.current_timestamp += 1;

        inner
            .frame_info
            .entry(frame_id)
            .or_insert_with(FrameAccessInfo::new)
            .record_access(timestamp, self.k);
    }

    /// Sets whether a frame is evictable. A frame becomes evictable when
    /// its pin count drops to zero.
    pub fn set_evictable(&self, frame_id: FrameId, is_evictable: bool) {
        if frame_id.as_usize() >= self.max_frames {
            return;
        }

        let mut inner = self.inner.lock();

        if let Some(info) = inner.frame_info.get_mut(&frame_id) {
            if info.is_evictable != is_evictable {
                info.is_evictable = is_evictable;
                if is_evictable {
                    inner.num_evictable += 1;
                } else {
                    inner.num_evictable -= 1;
                }
            }
        } else if is_evictable {
            let mut info = FrameAccessInfo::new();
            info.is_evictable = true;
            inner.frame_info.insert(frame_id, info);
            inner.num_evictable += 1;
        }
    }

    /// Removes a frame's metadata entirely. A no-op for unknown frames;
    /// refuses frames that are currently non-evictable.
    pub fn remove(&self, frame_id: FrameId) {
        let mut inner = self.inner.lock();

        match inner.frame_info.get(&frame_id) {
            None => {}
            Some(info) if !info.is_evictable => {
                tracing::debug!(frame = %frame_id, "remove called on non-evictable frame");
            }
            Some(_) => {
                inner.frame_info.remove(&frame_id);
                inner.num_evictable -= 1;
            }
        }
    }

    /// Returns the number of evictable frames.
    pub fn size(&self) -> usize {
        self.inner.lock().num_evictable
    }

    /// Returns the k value of this replacer.
    pub fn k(&self) -> usize {
        self.k
    }
}
