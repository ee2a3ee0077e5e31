//! Tachometer pulse counting.
//!
//! Fans report speed as an open-collector square wave, two pulses per
//! revolution. Two counting strategies are offered: an edge-triggered counter
//! for pins with a usable interrupt, and a majority-vote sampler for noisy
//! lines polled at a fixed rate. Either way the aggregation side only ever
//! calls [`TachometerStrategy::take_pulses`].

use embassy_time::{Duration, Instant};
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::{PULSES_PER_REVOLUTION, TACH_DEBOUNCE_MS, TACH_VOTE_MAJORITY, TACH_VOTE_SLOTS};

const NO_EDGE: u64 = u64::MAX;
const VOTE_MASK: u8 = (1 << TACH_VOTE_SLOTS) - 1;

/// Source of accumulated tachometer pulses.
pub trait TachometerStrategy: Sync {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Pulses accumulated since the last call; resets the counter atomically.
    fn take_pulses(&self) -> u32;

    /// Pulses accumulated so far, without resetting.
    fn pending_pulses(&self) -> u32;
}

/// Counts rising edges, ignoring any edge that follows the previously
/// accepted one by less than the debounce interval.
pub struct EdgeCounter {
    pulses: AtomicU32,
    last_edge_ms: AtomicU64,
}

impl EdgeCounter {
    pub const fn new() -> Self {
        Self {
            pulses: AtomicU32::new(0),
            last_edge_ms: AtomicU64::new(NO_EDGE),
        }
    }

    /// Record a rising edge seen at `at`. Returns whether it counted.
    pub fn on_rising_edge(&self, at: Instant) -> bool {
        let now = at.as_millis();
        let last = self.last_edge_ms.load(Ordering::Acquire);
        if last != NO_EDGE && now.saturating_sub(last) < TACH_DEBOUNCE_MS {
            return false;
        }
        // Only one edge handler runs per pin; a lost race here means the other
        // caller already recorded this edge.
        if self
            .last_edge_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.pulses.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl Default for EdgeCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TachometerStrategy for EdgeCounter {
    fn name(&self) -> &'static str {
        "edge"
    }

    fn take_pulses(&self) -> u32 {
        self.pulses.swap(0, Ordering::AcqRel)
    }

    fn pending_pulses(&self) -> u32 {
        self.pulses.load(Ordering::Relaxed)
    }
}

/// Debounces a polled tach line by majority vote over the last five samples.
///
/// The window is a 5-bit shift register; the debounced level is high when at
/// least three of those bits are set, and each low-to-high transition of the
/// debounced level is one pulse.
pub struct MajorityVote {
    window: AtomicU8,
    debounced: AtomicBool,
    pulses: AtomicU32,
}

impl MajorityVote {
    pub const fn new() -> Self {
        Self {
            window: AtomicU8::new(0),
            debounced: AtomicBool::new(false),
            pulses: AtomicU32::new(0),
        }
    }

    /// Push one raw pin level. Returns whether it completed a pulse.
    pub fn sample(&self, level: bool) -> bool {
        let window = ((self.window.load(Ordering::Relaxed) << 1) | level as u8) & VOTE_MASK;
        self.window.store(window, Ordering::Relaxed);

        let high = window.count_ones() >= TACH_VOTE_MAJORITY;
        let was_high = self.debounced.swap(high, Ordering::AcqRel);
        if high && !was_high {
            self.pulses.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Current debounced level.
    pub fn level(&self) -> bool {
        self.debounced.load(Ordering::Relaxed)
    }
}

impl Default for MajorityVote {
    fn default() -> Self {
        Self::new()
    }
}

impl TachometerStrategy for MajorityVote {
    fn name(&self) -> &'static str {
        "majority-vote"
    }

    fn take_pulses(&self) -> u32 {
        self.pulses.swap(0, Ordering::AcqRel)
    }

    fn pending_pulses(&self) -> u32 {
        self.pulses.load(Ordering::Relaxed)
    }
}

/// RPM for `pulses` counted over `window`.
pub fn rpm_from_pulses(pulses: u32, window: Duration) -> u32 {
    let window_ms = window.as_millis();
    if window_ms == 0 {
        return 0;
    }
    let revolutions = (pulses / PULSES_PER_REVOLUTION) as u64;
    let rpm = revolutions * (60_000 / window_ms);
    rpm.min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges_counted() {
        let tach = EdgeCounter::new();
        for ms in [0, 10, 20, 30] {
            assert!(tach.on_rising_edge(Instant::from_millis(ms)));
        }
        assert_eq!(tach.pending_pulses(), 4);
        assert_eq!(tach.take_pulses(), 4);
        assert_eq!(tach.take_pulses(), 0);
    }

    #[test]
    fn test_bounce_ignored() {
        let tach = EdgeCounter::new();
        assert!(tach.on_rising_edge(Instant::from_millis(100)));
        assert!(!tach.on_rising_edge(Instant::from_millis(101)));
        assert!(!tach.on_rising_edge(Instant::from_millis(104)));
        // Debounce is measured from the last accepted edge
        assert!(tach.on_rising_edge(Instant::from_millis(105)));
        assert_eq!(tach.take_pulses(), 2);
    }

    #[test]
    fn test_first_edge_at_zero_counts() {
        let tach = EdgeCounter::new();
        assert!(tach.on_rising_edge(Instant::from_millis(0)));
        assert!(!tach.on_rising_edge(Instant::from_millis(2)));
    }

    #[test]
    fn test_majority_vote_single_glitch_ignored() {
        let tach = MajorityVote::new();
        for level in [false, false, true, false, false, false] {
            assert!(!tach.sample(level));
        }
        assert!(!tach.level());
        assert_eq!(tach.take_pulses(), 0);
    }

    #[test]
    fn test_majority_vote_counts_transitions() {
        let tach = MajorityVote::new();
        let mut pulses = 0;
        // Two full periods of a clean square wave, 5 samples high then 5 low
        for _ in 0..2 {
            for level in [true, true, true, true, true, false, false, false, false, false] {
                if tach.sample(level) {
                    pulses += 1;
                }
            }
        }
        assert_eq!(pulses, 2);
        assert_eq!(tach.take_pulses(), 2);
    }

    #[test]
    fn test_majority_needs_three_highs() {
        let tach = MajorityVote::new();
        assert!(!tach.sample(true));
        assert!(!tach.sample(true));
        assert!(tach.sample(true));
        assert!(tach.level());
        // Staying high is not a new pulse
        assert!(!tach.sample(true));
    }

    #[test]
    fn test_rpm_from_pulses() {
        let window = Duration::from_millis(1000);
        assert_eq!(rpm_from_pulses(0, window), 0);
        assert_eq!(rpm_from_pulses(40, window), 1200);
        // Odd pulse counts round down to whole revolutions
        assert_eq!(rpm_from_pulses(41, window), 1200);
        assert_eq!(rpm_from_pulses(20, Duration::from_millis(500)), 1200);
        assert_eq!(rpm_from_pulses(20, Duration::from_millis(0)), 0);
    }
}
