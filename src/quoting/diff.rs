//! Order diff: desired quotes vs tracked live orders.
//!
//! An order already resting at the desired price (same slot, within half a
//! tick) is kept untouched, preserving its queue priority and its venue
//! order id. Everything else is cancelled, and desired entries with
//! no kept match are placed. Cancels always execute before places so the
//! two never fight for the same slot.

use std::collections::HashMap;

use crate::grid::PriceGrid;
use crate::types::{OrderKey, TrackedOrder};

/// One desired resting order.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredEntry {
    pub key: OrderKey,
    pub token: String,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Default)]
pub struct OrderDiff {
    /// Tracked orders left alone (queue priority preserved).
    pub keep: Vec<TrackedOrder>,
    /// Tracked orders to cancel, first.
    pub cancel: Vec<TrackedOrder>,
    /// Desired entries to place, second.
    pub place: Vec<DesiredEntry>,
}

impl OrderDiff {
    pub fn is_noop(&self) -> bool {
        self.cancel.is_empty() && self.place.is_empty()
    }
}

pub fn diff_orders(
    desired: &[DesiredEntry],
    tracked: &[TrackedOrder],
    grid: &PriceGrid,
) -> OrderDiff {
    let desired_by_key: HashMap<OrderKey, &DesiredEntry> =
        desired.iter().map(|d| (d.key, d)).collect();

    let mut out = OrderDiff::default();
    let mut kept_keys: Vec<OrderKey> = Vec::new();

    for order in tracked {
        match desired_by_key.get(&order.key) {
            Some(want) if grid.same_slot(order.price, want.price) => {
                kept_keys.push(order.key);
                out.keep.push(order.clone());
            }
            _ => out.cancel.push(order.clone()),
        }
    }

    for want in desired {
        if !kept_keys.contains(&want.key) {
            out.place.push(want.clone());
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderSide, Outcome};
    use chrono::Utc;

    fn want(outcome: Outcome, side: OrderSide, tier: u32, price: f64, size: f64) -> DesiredEntry {
        DesiredEntry {
            key: OrderKey::new(outcome, side, tier),
            token: "tok".to_string(),
            price,
            size,
        }
    }

    fn live(outcome: Outcome, side: OrderSide, tier: u32, price: f64, id: &str) -> TrackedOrder {
        TrackedOrder {
            mm_id: 1,
            key: OrderKey::new(outcome, side, tier),
            order_id: id.to_string(),
            client_order_id: None,
            order_group_id: None,
            token: "tok".to_string(),
            price,
            size: 10.0,
            last_matched_size: None,
            placed_at: Utc::now(),
        }
    }

    #[test]
    fn test_keep_at_price_preserves_order_id() {
        // Desired YES-BID (0.47, 10) vs tracked YES-BID (0.47, 10):
        // no cancels, no places, id retained.
        let grid = PriceGrid::default();
        let d = vec![want(Outcome::Yes, OrderSide::Buy, 0, 0.47, 10.0)];
        let t = vec![live(Outcome::Yes, OrderSide::Buy, 0, 0.47, "venue-1")];
        let diff = diff_orders(&d, &t, &grid);
        assert!(diff.is_noop());
        assert_eq!(diff.keep.len(), 1);
        assert_eq!(diff.keep[0].order_id, "venue-1");
    }

    #[test]
    fn test_half_tick_tolerance() {
        let grid = PriceGrid::default();
        let d = vec![want(Outcome::Yes, OrderSide::Buy, 0, 0.474, 10.0)];
        let t = vec![live(Outcome::Yes, OrderSide::Buy, 0, 0.47, "venue-1")];
        // 0.004 < half a 0.01 tick → same slot, keep.
        let diff = diff_orders(&d, &t, &grid);
        assert!(diff.is_noop());
    }

    #[test]
    fn test_price_move_cancels_and_places() {
        let grid = PriceGrid::default();
        let d = vec![want(Outcome::Yes, OrderSide::Buy, 0, 0.48, 10.0)];
        let t = vec![live(Outcome::Yes, OrderSide::Buy, 0, 0.47, "venue-1")];
        let diff = diff_orders(&d, &t, &grid);
        assert_eq!(diff.cancel.len(), 1);
        assert_eq!(diff.place.len(), 1);
        assert!(diff.keep.is_empty());
    }

    #[test]
    fn test_symmetric_difference() {
        // cancel ∪ place equals the symmetric difference of desired vs live.
        let grid = PriceGrid::default();
        let d = vec![
            want(Outcome::Yes, OrderSide::Buy, 0, 0.47, 10.0), // kept
            want(Outcome::Yes, OrderSide::Sell, 0, 0.53, 10.0), // new
            want(Outcome::No, OrderSide::Buy, 0, 0.44, 10.0),  // new
        ];
        let t = vec![
            live(Outcome::Yes, OrderSide::Buy, 0, 0.47, "keep-me"),
            live(Outcome::No, OrderSide::Sell, 0, 0.58, "stale-1"), // no longer desired
        ];
        let diff = diff_orders(&d, &t, &grid);
        assert_eq!(diff.keep.len(), 1);
        assert_eq!(diff.keep[0].order_id, "keep-me");
        assert_eq!(diff.cancel.len(), 1);
        assert_eq!(diff.cancel[0].order_id, "stale-1");
        assert_eq!(diff.place.len(), 2);
        // Intersection (kept) never shows up in either action set.
        assert!(diff.cancel.iter().all(|o| o.order_id != "keep-me"));
        assert!(diff.place.iter().all(|p| p.key != diff.keep[0].key));
    }

    #[test]
    fn test_tiers_are_distinct_slots() {
        let grid = PriceGrid::default();
        let d = vec![
            want(Outcome::Yes, OrderSide::Buy, 0, 0.47, 5.0),
            want(Outcome::Yes, OrderSide::Buy, 1, 0.46, 3.0),
        ];
        let t = vec![live(Outcome::Yes, OrderSide::Buy, 0, 0.47, "t0")];
        let diff = diff_orders(&d, &t, &grid);
        assert_eq!(diff.keep.len(), 1);
        assert_eq!(diff.place.len(), 1);
        assert_eq!(diff.place[0].key.tier, 1);
    }

    #[test]
    fn test_empty_desired_cancels_everything() {
        let grid = PriceGrid::default();
        let t = vec![
            live(Outcome::Yes, OrderSide::Buy, 0, 0.47, "a"),
            live(Outcome::No, OrderSide::Sell, 0, 0.55, "b"),
        ];
        let diff = diff_orders(&[], &t, &grid);
        assert_eq!(diff.cancel.len(), 2);
        assert!(diff.place.is_empty());
    }
}
