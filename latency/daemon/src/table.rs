//! Cross-point correlation table
//!
//! A fixed array of slots, each behind its own lock. A key always maps to
//! the same slot; whichever key last wrote a slot owns it. Observations for
//! different slots never contend.
//!
//! Slot lifecycle: `Empty -> Partial(mask) -> Complete -> Empty`. The final
//! mask update, the completeness check, the read-out and the reset all happen
//! inside one critical section, so exactly one caller sees the record.
//!
//! Retention is lossy by construction: when more keys are in flight than
//! there are slots, a new key overwrites whatever partial measurement held
//! its slot. Overwrites are counted, never reported as errors.

use crate::types::{
    CorrelationKey, CorrelationMode, MeasurementRecord, PipelinePoint, PointMask, TableStats,
    Timestamp,
};
use log::{debug, trace};
use parking_lot::Mutex;
use pktlat_common::POINT_COUNT;
use std::collections::hash_map::DefaultHasher;
use std::hash::{BuildHasher, BuildHasherDefault};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct Slot {
    key: Option<CorrelationKey>,
    stamps: [Option<Timestamp>; POINT_COUNT],
    mask: PointMask,
    /// Bumped every time a new key-cycle claims the slot
    generation: u64,
}

impl Slot {
    fn claim(&mut self, key: CorrelationKey) {
        self.key = Some(key);
        self.stamps = [None; POINT_COUNT];
        self.mask = PointMask::EMPTY;
        self.generation = self.generation.wrapping_add(1);
    }

    fn reset(&mut self) {
        self.key = None;
        self.stamps = [None; POINT_COUNT];
        self.mask = PointMask::EMPTY;
    }
}

/// What happened to the previous occupant of a slot
enum Eviction {
    None,
    Collision {
        previous: CorrelationKey,
        generation: u64,
    },
    Restart {
        generation: u64,
    },
}

#[derive(Default)]
struct Counters {
    recorded: AtomicU64,
    completed: AtomicU64,
    collisions: AtomicU64,
    restarts: AtomicU64,
    ignored: AtomicU64,
}

/// Concurrent, fixed-capacity store of in-flight correlations
pub struct CorrelationTable {
    mode: CorrelationMode,
    slots: Box<[Mutex<Slot>]>,
    hasher: BuildHasherDefault<DefaultHasher>,
    counters: Counters,
}

impl CorrelationTable {
    /// Create a table with `capacity` slots (at least one)
    pub fn new(capacity: usize, mode: CorrelationMode) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| Mutex::new(Slot::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            mode,
            slots,
            hasher: BuildHasherDefault::default(),
            counters: Counters::default(),
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot a key maps to; stable for the lifetime of the table
    pub fn slot_index(&self, key: &CorrelationKey) -> usize {
        (self.hasher.hash_one(key) % self.slots.len() as u64) as usize
    }

    /// Record one observation
    ///
    /// Returns the completed measurement when this observation fills the
    /// last expected point for its key. The slot lock is released before
    /// returning, so the caller may aggregate or send the record freely.
    pub fn record(
        &self,
        key: CorrelationKey,
        point: PipelinePoint,
        timestamp: Timestamp,
    ) -> Option<MeasurementRecord> {
        let expected = self.mode.expected();
        if !expected.contains(point) {
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let index = self.slot_index(&key);
        let mut slot = self.slots[index].lock();

        let eviction = match slot.key {
            Some(current) if current != key => {
                let previous = current;
                let generation = slot.generation;
                slot.claim(key);
                Eviction::Collision {
                    previous,
                    generation,
                }
            }
            // Same key seen at the same point again: the key was reused
            // before the previous cycle completed.
            Some(_) if slot.mask.contains(point) => {
                let generation = slot.generation;
                slot.claim(key);
                Eviction::Restart { generation }
            }
            Some(_) => Eviction::None,
            None => {
                slot.claim(key);
                Eviction::None
            }
        };

        slot.stamps[point.index()] = Some(timestamp);
        slot.mask.insert(point);

        let completed = if slot.mask.contains_all(expected) {
            let stamps = slot.stamps;
            slot.reset();
            Some(MeasurementRecord::new(key, self.mode, stamps))
        } else {
            None
        };
        drop(slot);

        self.counters.recorded.fetch_add(1, Ordering::Relaxed);
        match eviction {
            Eviction::None => {}
            Eviction::Collision {
                previous,
                generation,
            } => {
                self.counters.collisions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "slot {}: {} (generation {}) overwritten by {}",
                    index, previous, generation, key
                );
            }
            Eviction::Restart { generation } => {
                self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "slot {}: {} repeated {} before completing (generation {})",
                    index, key, point, generation
                );
            }
        }

        if let Some(record) = &completed {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            trace!("slot {}: completed {}", index, record);
        }

        completed
    }

    /// Number of slots currently holding a partial measurement
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().key.is_some())
            .count()
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            recorded: self.counters.recorded.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            collisions: self.counters.collisions.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Leg;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn ts(micros: u64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    fn skb(n: u64) -> CorrelationKey {
        CorrelationKey::skb(format!("{:016x}", n).as_bytes()).unwrap()
    }

    /// Keys that all map to different slots of `table`
    fn distinct_slot_keys(table: &CorrelationTable, count: usize) -> Vec<CorrelationKey> {
        let mut used = vec![false; table.capacity()];
        let mut keys = Vec::with_capacity(count);
        let mut n = 0u64;
        while keys.len() < count {
            let key = skb(0xffff_8880_0000_0000 + n * 0x100);
            let index = table.slot_index(&key);
            if !used[index] {
                used[index] = true;
                keys.push(key);
            }
            n += 1;
        }
        keys
    }

    #[test]
    fn test_single_leg_completion() {
        let table = CorrelationTable::new(64, CorrelationMode::Outbound);
        let key = skb(1);

        assert!(table
            .record(key, PipelinePoint::OuterOutbound, ts(1_000))
            .is_none());
        let record = table
            .record(key, PipelinePoint::InnerOutbound, ts(1_250))
            .unwrap();

        assert_eq!(record.key, key);
        assert_eq!(record.latency(Leg::Outbound).unwrap().as_micros(), 250);
        assert_eq!(table.in_flight(), 0);

        let stats = table.stats();
        assert_eq!(stats.recorded, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.collisions, 0);
    }

    #[test]
    fn test_later_point_arriving_first() {
        let table = CorrelationTable::new(64, CorrelationMode::Outbound);
        let key = skb(2);

        assert!(table
            .record(key, PipelinePoint::InnerOutbound, ts(5_300))
            .is_none());
        let record = table
            .record(key, PipelinePoint::OuterOutbound, ts(5_000))
            .unwrap();
        assert_eq!(record.latency(Leg::Outbound).unwrap().as_micros(), 300);
    }

    #[test]
    fn test_every_arrival_order_completes_once() {
        let points = PipelinePoint::ALL;
        let mut orders = Vec::new();
        for a in 0..4 {
            for b in 0..4 {
                for c in 0..4 {
                    for d in 0..4 {
                        let order = [a, b, c, d];
                        let mut seen = [false; 4];
                        order.iter().for_each(|&i| seen[i] = true);
                        if seen.iter().all(|&s| s) {
                            orders.push(order);
                        }
                    }
                }
            }
        }
        assert_eq!(orders.len(), 24);

        let table = CorrelationTable::new(16, CorrelationMode::RoundTrip);
        for (n, order) in orders.iter().enumerate() {
            let key = CorrelationKey::echo(7, n as u16);
            let emitted: Vec<_> = order
                .iter()
                .filter_map(|&i| table.record(key, points[i], ts(100 * i as u64)))
                .collect();
            assert_eq!(emitted.len(), 1, "order {:?}", order);
            assert_eq!(emitted[0].latency(Leg::RoundTrip).unwrap().as_micros(), 300);
        }
        assert_eq!(table.stats().completed, 24);
    }

    #[test]
    fn test_collision_overwrites_stale_key() {
        let table = CorrelationTable::new(1, CorrelationMode::Outbound);
        let k1 = skb(10);
        let k2 = skb(11);
        assert_eq!(table.slot_index(&k1), table.slot_index(&k2));

        assert!(table
            .record(k1, PipelinePoint::OuterOutbound, ts(100))
            .is_none());
        assert!(table
            .record(k2, PipelinePoint::OuterOutbound, ts(200))
            .is_none());
        let record = table
            .record(k2, PipelinePoint::InnerOutbound, ts(260))
            .unwrap();
        assert_eq!(record.key, k2);
        assert_eq!(record.latency(Leg::Outbound).unwrap().as_micros(), 60);

        // k1's first half is gone; its second half only starts a new cycle
        assert!(table
            .record(k1, PipelinePoint::InnerOutbound, ts(300))
            .is_none());
        assert_eq!(table.stats().collisions, 1);
        assert_eq!(table.stats().completed, 1);
        assert_eq!(table.in_flight(), 1);
    }

    #[test]
    fn test_repeated_point_restarts_cycle() {
        let table = CorrelationTable::new(8, CorrelationMode::Outbound);
        let key = skb(3);

        table.record(key, PipelinePoint::OuterOutbound, ts(100));
        table.record(key, PipelinePoint::OuterOutbound, ts(900));
        let record = table
            .record(key, PipelinePoint::InnerOutbound, ts(950))
            .unwrap();

        assert_eq!(record.latency(Leg::Outbound).unwrap().as_micros(), 50);
        assert_eq!(table.stats().restarts, 1);
    }

    #[test]
    fn test_points_outside_mode_are_ignored() {
        let table = CorrelationTable::new(8, CorrelationMode::Inbound);
        let key = skb(4);

        assert!(table
            .record(key, PipelinePoint::OuterOutbound, ts(1))
            .is_none());
        assert_eq!(table.stats().ignored, 1);
        assert_eq!(table.stats().recorded, 0);
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_zero_capacity_rounds_up() {
        let table = CorrelationTable::new(0, CorrelationMode::Outbound);
        assert_eq!(table.capacity(), 1);
    }

    #[test]
    fn test_concurrent_completion_emits_once() {
        const ROUNDS: u16 = 200;
        let table = Arc::new(CorrelationTable::new(32, CorrelationMode::RoundTrip));
        let barrier = Arc::new(Barrier::new(PipelinePoint::ALL.len()));

        let handles: Vec<_> = PipelinePoint::ALL
            .iter()
            .map(|&point| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut emitted = 0u32;
                    for seq in 0..ROUNDS {
                        barrier.wait();
                        let key = CorrelationKey::echo(42, seq);
                        let stamp = ts(seq as u64 * 10_000 + point.index() as u64 * 10);
                        if table.record(key, point, stamp).is_some() {
                            emitted += 1;
                        }
                    }
                    emitted
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, ROUNDS as u32);
        assert_eq!(table.stats().completed, ROUNDS as u64);
        assert_eq!(table.in_flight(), 0);
    }

    #[test]
    fn test_interleaved_pairs_across_threads() {
        const THREADS: usize = 8;
        const LIVE_KEYS: usize = 16;
        const PAIRS: usize = 10_000;

        let table = Arc::new(CorrelationTable::new(128, CorrelationMode::Outbound));
        let keys = distinct_slot_keys(&table, LIVE_KEYS);
        // Threads 2i and 2i+1 share a group of keys: the even thread sees
        // each key on the outer device, the odd one on the inner device
        let keys_per_group = LIVE_KEYS / (THREADS / 2);
        let cycles = PAIRS / LIVE_KEYS;

        let mut rng = StdRng::seed_from_u64(42);
        let delays: Arc<Vec<u64>> =
            Arc::new((0..cycles * LIVE_KEYS).map(|_| rng.random_range(1..500)).collect());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let table = Arc::clone(&table);
                let delays = Arc::clone(&delays);
                let barrier = Arc::clone(&barrier);
                let group = t / 2;
                let first_lane = group * keys_per_group;
                let lanes = keys[first_lane..first_lane + keys_per_group].to_vec();
                let point = if t % 2 == 0 {
                    PipelinePoint::OuterOutbound
                } else {
                    PipelinePoint::InnerOutbound
                };
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    let mut records = Vec::new();
                    let mut order: Vec<usize> = (0..lanes.len()).collect();
                    for cycle in 0..cycles {
                        // Both points of a cycle land before either thread
                        // moves on to the next one
                        barrier.wait();
                        order.shuffle(&mut rng);

                        let base = cycle as u64 * 1_000;
                        for &lane in &order {
                            let stamp = match point {
                                PipelinePoint::OuterOutbound => ts(base),
                                _ => ts(base + delays[cycle * LIVE_KEYS + first_lane + lane]),
                            };
                            if let Some(record) = table.record(lanes[lane], point, stamp) {
                                records.push(record);
                            }
                        }
                    }
                    records
                })
            })
            .collect();

        let records: Vec<MeasurementRecord> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(records.len(), PAIRS);
        assert!(records
            .iter()
            .all(|r| !r.latency(Leg::Outbound).unwrap().is_negative()));
        assert_eq!(table.stats().collisions, 0);
        assert_eq!(table.stats().restarts, 0);
    }
}
