//! Property tests for the planner and schedule resolution invariants.

use proptest::prelude::*;

use sunsynk_bridge::planner::plan;
use sunsynk_bridge::schedule::{Schedule, ScheduleTable};

/// A due sensor: a contiguous register tuple of width 1..=4.
fn arb_sensors() -> impl Strategy<Value = Vec<Vec<u16>>> {
    proptest::collection::vec((0u16..500, 1u16..=4), 1..40).prop_map(|tuples| {
        tuples
            .into_iter()
            .map(|(start, width)| (start..start + width).collect())
            .collect()
    })
}

proptest! {
    /// Every due sensor's word set is contained in exactly one emitted
    /// span, no span exceeds the batch size, and requested addresses
    /// inside a span never straddle a gap wider than the budget.
    #[test]
    fn planner_invariants(
        sensors in arb_sensors(),
        batch_size in 4u16..=30,
        allow_gap in 0u16..=5,
    ) {
        let due: Vec<&[u16]> = sensors.iter().map(Vec::as_slice).collect();
        let planned = plan(&due, batch_size, allow_gap);

        // (a) Coverage: each sensor assigned to exactly one span that
        // covers its whole tuple.
        let mut assigned = vec![0usize; due.len()];
        for p in &planned {
            for &idx in &p.sensors {
                assigned[idx] += 1;
                prop_assert!(
                    p.span.covers(due[idx]),
                    "span {:?} does not cover sensor {:?}",
                    p.span,
                    due[idx]
                );
            }
        }
        prop_assert!(
            assigned.iter().all(|&n| n == 1),
            "every sensor must belong to exactly one span: {assigned:?}"
        );

        // (b) Batch budget.
        for p in &planned {
            prop_assert!(
                p.span.count <= batch_size,
                "span {:?} exceeds batch size {batch_size}",
                p.span
            );
        }

        // (c) Gap budget between requested addresses within a span.
        let mut requested: Vec<u16> = sensors.iter().flatten().copied().collect();
        requested.sort_unstable();
        requested.dedup();
        for p in &planned {
            let inside: Vec<u16> = requested
                .iter()
                .copied()
                .filter(|&a| p.span.contains(a))
                .collect();
            for w in inside.windows(2) {
                prop_assert!(
                    w[1] - w[0] - 1 <= allow_gap,
                    "gap {} inside span {:?} exceeds {allow_gap}",
                    w[1] - w[0] - 1,
                    p.span
                );
            }
        }
    }

    /// Every sensor id resolves to exactly one schedule, whatever the
    /// configured overrides look like.
    #[test]
    fn every_id_resolves_to_one_schedule(
        id in "[a-z][a-z0-9_]{0,30}",
        keys in proptest::collection::vec("[a-z_*]{0,8}", 0..6),
    ) {
        let configured: Vec<Schedule> = keys
            .iter()
            .map(|k| Schedule::new(k, 7, 70))
            .collect();
        let table = ScheduleTable::new(&configured);
        let schedule = table.resolve(&id);
        prop_assert!(schedule.read_every > 0);
    }
}
