//! Dataset sharding across worker threads.
//!
//! Shards start from a static cost estimate and are then corrected round by
//! round using the CPU time each worker actually spent.

use std::time::{Duration, Instant};

use crate::model::GraphicalModel;

/// Relative cost of computing one datum's objective and gradient.
pub trait TrainingCost {
    /// Only compared against other data of the same set; never affects results
    fn estimated_cost(&self) -> u64 {
        1
    }
}

impl TrainingCost for GraphicalModel {
    /// Sum of the table sizes of every factor
    fn estimated_cost(&self) -> u64 {
        self.factors()
            .iter()
            .map(|f| f.features_table.combinatorial_neighbor_states_count() as u64)
            .fold(0u64, u64::saturating_add)
    }
}

/// Split `0..dataset.len()` into at most `num_threads` shards with roughly equal cost.
///
/// Greedy longest-processing-time: the most expensive remaining datum goes
/// to the currently cheapest shard. Every shard is non-empty.
pub(crate) fn initial_shards<T: TrainingCost>(dataset: &[T], num_threads: usize) -> Vec<Vec<usize>> {
    let num_shards = num_threads.max(1).min(dataset.len());
    let mut order: Vec<(u64, usize)> = dataset
        .iter()
        .enumerate()
        .map(|(i, datum)| (datum.estimated_cost(), i))
        .collect();
    order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

    let mut shards = vec![Vec::new(); num_shards];
    let mut loads = vec![0u64; num_shards];
    for (cost, i) in order {
        let (target, _) = loads
            .iter()
            .enumerate()
            .min_by_key(|&(shard, load)| (*load, shard))
            .unwrap_or((0, &0));
        shards[target].push(i);
        loads[target] = loads[target].saturating_add(cost.max(1));
    }
    for shard in &mut shards {
        shard.sort_unstable();
    }
    shards
}

/// A move of data between two shards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Migration {
    pub(crate) from: usize,
    pub(crate) to: usize,
    pub(crate) count: usize,
}

/// Move data from the end of the slowest shard to the fastest one.
///
/// The moved fraction is `(max - min) / (2 * max)` of the slow shard,
/// capped at `fraction_cap`.
pub(crate) fn rebalance(
    shards: &mut [Vec<usize>],
    cpu_times: &[Duration],
    fraction_cap: f64,
) -> Option<Migration> {
    if shards.len() < 2 || cpu_times.len() != shards.len() {
        return None;
    }
    let (slow, max) = cpu_times
        .iter()
        .enumerate()
        .max_by_key(|&(i, t)| (*t, std::cmp::Reverse(i)))?;
    let (fast, min) = cpu_times.iter().enumerate().min_by_key(|&(i, t)| (*t, i))?;
    if slow == fast || max.is_zero() {
        return None;
    }
    let (max, min) = (max.as_secs_f64(), min.as_secs_f64());
    let fraction = ((max - min) / (2.0 * max)).min(fraction_cap);
    let count = (shards[slow].len() as f64 * fraction).floor() as usize;
    if count == 0 {
        return None;
    }
    let split = shards[slow].len() - count;
    let moved: Vec<usize> = shards[slow].drain(split..).collect();
    shards[fast].extend(moved);
    Some(Migration {
        from: slow,
        to: fast,
        count,
    })
}

/// CPU time consumed by the calling thread, when the platform reports it
#[cfg(unix)]
fn thread_cpu_time() -> Option<Duration> {
    // SAFETY: timespec is plain data and clock_gettime only writes into it
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

#[cfg(not(unix))]
fn thread_cpu_time() -> Option<Duration> {
    None
}

/// Measures the CPU time of the thread that created it, falling back to wall time.
#[derive(Debug)]
pub(crate) struct CpuTimer {
    cpu: Option<Duration>,
    wall: Instant,
}

impl CpuTimer {
    pub(crate) fn start() -> Self {
        Self {
            cpu: thread_cpu_time(),
            wall: Instant::now(),
        }
    }

    /// Must be called on the thread that started the timer
    pub(crate) fn elapsed(&self) -> Duration {
        match (self.cpu, thread_cpu_time()) {
            (Some(start), Some(now)) => now.saturating_sub(start),
            _ => self.wall.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Cost(u64);

    impl TrainingCost for Cost {
        fn estimated_cost(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn test_initial_shards_partition() {
        let data: Vec<Cost> = [5, 1, 1, 1, 1, 1, 4].iter().map(|&c| Cost(c)).collect();
        let shards = initial_shards(&data, 2);
        assert_eq!(shards.len(), 2);
        let mut all: Vec<usize> = shards.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
        let load = |shard: &Vec<usize>| shard.iter().map(|&i| data[i].0).sum::<u64>();
        assert_eq!(load(&shards[0]), 7);
        assert_eq!(load(&shards[1]), 7);
    }

    #[test]
    fn test_more_threads_than_data() {
        let data = vec![Cost(1), Cost(2)];
        let shards = initial_shards(&data, 8);
        assert_eq!(shards.len(), 2);
        assert!(shards.iter().all(|s| s.len() == 1));
        assert!(initial_shards::<Cost>(&[], 4).is_empty());
    }

    #[test]
    fn test_rebalance_moves_from_slowest() {
        let mut shards = vec![(0..11).collect::<Vec<_>>(), vec![20, 21], vec![22]];
        let times = [
            Duration::from_millis(100),
            Duration::from_millis(20),
            Duration::from_millis(60),
        ];
        let migration = rebalance(&mut shards, &times, 0.5).unwrap();
        // (100 - 20) / 200 = 0.4 of 11 items
        assert_eq!(
            migration,
            Migration {
                from: 0,
                to: 1,
                count: 4
            }
        );
        assert_eq!(shards[0], (0..7).collect::<Vec<_>>());
        assert_eq!(shards[1], vec![20, 21, 7, 8, 9, 10]);
    }

    #[test]
    fn test_rebalance_respects_cap() {
        let mut shards = vec![(0..11).collect::<Vec<_>>(), vec![20]];
        let times = [Duration::from_millis(100), Duration::from_millis(0)];
        let migration = rebalance(&mut shards, &times, 0.2).unwrap();
        assert_eq!(migration.count, 2);
    }

    #[test]
    fn test_rebalance_noop_when_balanced() {
        let mut shards = vec![vec![0], vec![1]];
        let times = [Duration::from_millis(10), Duration::from_millis(10)];
        assert_eq!(rebalance(&mut shards, &times, 0.5), None);
    }

    #[test]
    fn test_cpu_timer_is_monotonic() {
        let timer = CpuTimer::start();
        let mut x = 0u64;
        for i in 0..100_000u64 {
            x = x.wrapping_mul(31).wrapping_add(i);
        }
        assert!(x != 1);
        let first = timer.elapsed();
        assert!(timer.elapsed() >= first);
    }
}
