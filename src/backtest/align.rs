//! Time alignment of funding events to price samples.
//!
//! A funding event at time `t` is matched, per market, to the first sample
//! whose timestamp is at or after `t`. Only partitions dated on or after the
//! UTC day of `t` are searched. When several samples share exactly the target
//! timestamp, the first one in file/row order wins; this tie-break is
//! arbitrary and callers should not read meaning into which of the tied
//! samples is returned.

use crate::backtest::data::{EnrichedEvent, FundingEvent, PriceIndex, PriceSample};
use crate::utils::time::day_of_millis;
use tracing::debug;

/// Scan position inside a [`PriceIndex`]: partition pointer plus in-partition offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct AlignCursor {
    pub partition: usize,
    pub offset: usize,
}

impl PriceIndex {
    /// Stateless lookup of the first sample at or after `target_millis`.
    ///
    /// Scans from the start of the target's day every time; use a
    /// [`TimeAligner`] when querying many non-decreasing targets.
    pub fn align(&self, target_millis: i64) -> Option<PriceSample> {
        let start = self.day_start(target_millis)?;
        let target = self.unit().from_millis(target_millis);
        scan(self, start, target).map(|(_, sample)| sample)
    }

    fn day_start(&self, target_millis: i64) -> Option<AlignCursor> {
        let day = day_of_millis(target_millis)?;
        Some(AlignCursor {
            partition: self.first_partition_from(day),
            offset: 0,
        })
    }
}

/// Return the first sample at or after `from` whose timestamp is `>= target`.
fn scan(index: &PriceIndex, from: AlignCursor, target: i64) -> Option<(AlignCursor, PriceSample)> {
    let partitions = index.partitions();

    for (p, partition) in partitions.iter().enumerate().skip(from.partition) {
        let skip = if p == from.partition { from.offset } else { 0 };
        let hit = partition
            .samples
            .iter()
            .enumerate()
            .skip(skip)
            .find(|(_, s)| s.timestamp >= target);

        if let Some((offset, sample)) = hit {
            return Some((AlignCursor { partition: p, offset }, *sample));
        }
    }

    None
}

/// Aligner holding a monotonic cursor over one market's index.
///
/// Results are identical to [`PriceIndex::align`]. While targets are
/// non-decreasing, each query resumes where the previous one stopped, so a
/// whole run costs one pass over the samples. A target earlier than the
/// previous one resets the cursor to a fresh scan from the target's day.
///
/// Each aligner owns its cursor; give every worker its own aligner.
#[derive(Debug)]
pub struct TimeAligner<'a> {
    index: &'a PriceIndex,
    cursor: AlignCursor,
    last_target: Option<i64>,
    rescans: usize,
}

impl<'a> TimeAligner<'a> {
    pub fn new(index: &'a PriceIndex) -> Self {
        Self {
            index,
            cursor: AlignCursor::default(),
            last_target: None,
            rescans: 0,
        }
    }

    /// First sample at or after `target_millis`, or `None` when the index
    /// holds nothing that late.
    pub fn align(&mut self, target_millis: i64) -> Option<PriceSample> {
        let day_start = self.index.day_start(target_millis)?;

        let from = match self.last_target {
            Some(prev) if target_millis >= prev => self.cursor.max(day_start),
            Some(_) => {
                self.rescans += 1;
                day_start
            }
            None => day_start,
        };
        self.last_target = Some(target_millis);

        let target = self.index.unit().from_millis(target_millis);
        match scan(self.index, from, target) {
            Some((cursor, sample)) => {
                // Stay on the hit: the next target may tie with it.
                self.cursor = cursor;
                Some(sample)
            }
            None => {
                self.cursor = AlignCursor {
                    partition: self.index.partitions().len(),
                    offset: 0,
                };
                None
            }
        }
    }

    /// Align a sequence of targets in order.
    pub fn align_all(&mut self, targets: &[i64]) -> Vec<Option<PriceSample>> {
        targets.iter().map(|&t| self.align(t)).collect()
    }

    /// Current cursor position.
    pub fn cursor(&self) -> AlignCursor {
        self.cursor
    }

    /// Number of times a backwards target forced a fresh scan.
    pub fn rescans(&self) -> usize {
        self.rescans
    }
}

/// Attach spot and futures samples to each funding event.
///
/// The two markets are aligned on separate scoped threads, each with its own
/// cursor; the indices are only read.
pub fn enrich_events(
    events: &[FundingEvent],
    spot: &PriceIndex,
    futures: &PriceIndex,
) -> Vec<EnrichedEvent> {
    let targets: Vec<i64> = events.iter().map(|e| e.funding_time).collect();

    let (spot_hits, futures_hits) = std::thread::scope(|s| {
        let spot_worker = s.spawn(|| TimeAligner::new(spot).align_all(&targets));
        let futures_hits = TimeAligner::new(futures).align_all(&targets);
        let spot_hits = match spot_worker.join() {
            Ok(hits) => hits,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        (spot_hits, futures_hits)
    });

    let enriched: Vec<EnrichedEvent> = events
        .iter()
        .zip(spot_hits)
        .zip(futures_hits)
        .map(|((event, spot), futures)| EnrichedEvent {
            event: event.clone(),
            spot,
            futures,
        })
        .collect();

    debug!(
        "Aligned {} events: {} spot gaps, {} futures gaps",
        enriched.len(),
        enriched.iter().filter(|e| e.spot.is_none()).count(),
        enriched.iter().filter(|e| e.futures.is_none()).count()
    );

    enriched
}
