//! Per-market price grid: tick lookup and quantisation.
//!
//! Venues publish an optional piecewise tick schedule (coarser ticks in the
//! middle of the book, finer near the bounds). Prices are clamped into the
//! quotable band before quantisation so the calculator can never emit a
//! price the venue would reject.

use crate::types::PriceRange;

pub const DEFAULT_TICK: f64 = 0.01;
pub const DEFAULT_MIN_PRICE: f64 = 0.01;
pub const DEFAULT_MAX_PRICE: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizeMode {
    Floor,
    Ceil,
    Round,
}

/// Tick table for one market.
#[derive(Debug, Clone)]
pub struct PriceGrid {
    /// Non-overlapping, ordered by start. Empty → flat default tick.
    ranges: Vec<PriceRange>,
    pub min_price: f64,
    pub max_price: f64,
}

impl Default for PriceGrid {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            min_price: DEFAULT_MIN_PRICE,
            max_price: DEFAULT_MAX_PRICE,
        }
    }
}

impl PriceGrid {
    pub fn new(mut ranges: Vec<PriceRange>) -> Self {
        ranges.retain(|r| r.step > 0.0 && r.end > r.start);
        ranges.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            ranges,
            ..Self::default()
        }
    }

    pub fn with_bounds(mut self, min_price: f64, max_price: f64) -> Self {
        self.min_price = min_price;
        self.max_price = max_price;
        self
    }

    /// Tick size of the band containing `p`; the default tick outside all bands.
    pub fn tick_size(&self, p: f64) -> f64 {
        for r in &self.ranges {
            if p >= r.start && p < r.end {
                return r.step;
            }
        }
        DEFAULT_TICK
    }

    /// Clamp into the quotable band, then snap to the grid.
    ///
    /// Idempotent on any grid-aligned input: quantising twice equals
    /// quantising once.
    pub fn quantize(&self, p: f64, mode: QuantizeMode) -> f64 {
        let clamped = p.clamp(self.min_price, self.max_price);
        let step = self.tick_size(clamped);
        let ticks = clamped / step;
        // Absorb float error so a grid-aligned price stays put regardless of mode.
        let ticks = match mode {
            QuantizeMode::Floor => (ticks + 1e-9).floor(),
            QuantizeMode::Ceil => (ticks - 1e-9).ceil(),
            QuantizeMode::Round => ticks.round(),
        };
        (ticks * step).clamp(self.min_price, self.max_price)
    }

    /// Whether two prices land on the same grid slot (within half a tick).
    pub fn same_slot(&self, a: f64, b: f64) -> bool {
        (a - b).abs() < self.tick_size(a) / 2.0
    }

    /// Whether `p` already sits on the grid.
    pub fn is_aligned(&self, p: f64) -> bool {
        let step = self.tick_size(p);
        let ticks = p / step;
        (ticks - ticks.round()).abs() < 1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn banded() -> PriceGrid {
        // Coarse middle, fine edges: the usual venue shape.
        PriceGrid::new(vec![
            PriceRange { start: 0.0, end: 0.05, step: 0.001 },
            PriceRange { start: 0.05, end: 0.95, step: 0.01 },
            PriceRange { start: 0.95, end: 1.0, step: 0.001 },
        ])
    }

    #[test]
    fn test_tick_lookup() {
        let g = banded();
        assert!((g.tick_size(0.02) - 0.001).abs() < 1e-12);
        assert!((g.tick_size(0.50) - 0.01).abs() < 1e-12);
        assert!((g.tick_size(0.97) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_default_tick_without_ranges() {
        let g = PriceGrid::default();
        assert!((g.tick_size(0.47) - DEFAULT_TICK).abs() < 1e-12);
    }

    #[test]
    fn test_quantize_modes() {
        let g = PriceGrid::default();
        assert!((g.quantize(0.123, QuantizeMode::Floor) - 0.12).abs() < 1e-9);
        assert!((g.quantize(0.123, QuantizeMode::Ceil) - 0.13).abs() < 1e-9);
        assert!((g.quantize(0.125, QuantizeMode::Round) - 0.13).abs() < 1e-9);
        assert!((g.quantize(0.1249, QuantizeMode::Round) - 0.12).abs() < 1e-9);
    }

    #[test]
    fn test_quantize_idempotent() {
        let g = banded();
        for mode in [QuantizeMode::Floor, QuantizeMode::Ceil, QuantizeMode::Round] {
            for raw in [0.0301, 0.123, 0.5, 0.951, 0.987654] {
                let once = g.quantize(raw, mode);
                let twice = g.quantize(once, mode);
                assert!(
                    (once - twice).abs() < 1e-12,
                    "mode {mode:?} raw {raw}: {once} vs {twice}"
                );
            }
        }
    }

    #[test]
    fn test_out_of_band_clamped() {
        let g = PriceGrid::default();
        assert!((g.quantize(-0.3, QuantizeMode::Floor) - DEFAULT_MIN_PRICE).abs() < 1e-9);
        assert!((g.quantize(1.7, QuantizeMode::Ceil) - DEFAULT_MAX_PRICE).abs() < 1e-9);
    }

    #[test]
    fn test_same_slot_half_tick() {
        let g = PriceGrid::default();
        assert!(g.same_slot(0.47, 0.47));
        assert!(g.same_slot(0.47, 0.474));
        assert!(!g.same_slot(0.47, 0.476));
    }

    #[test]
    fn test_alignment() {
        let g = banded();
        assert!(g.is_aligned(0.48));
        assert!(g.is_aligned(0.032));
        assert!(!g.is_aligned(0.0485));
    }
}
