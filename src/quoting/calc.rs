//! Pure quote calculator.
//!
//! Maps (mid, spread, inventory, caps, policy, touch, cost basis) to the
//! desired two-sided quote. No I/O, no clock, no state: everything the
//! function needs rides in on [`QuoteInputs`], which keeps it exhaustively
//! testable.

use crate::grid::{PriceGrid, QuantizeMode};
use crate::types::{QuoteTier, QuotingPolicy};

pub const DEFAULT_TIERS: [QuoteTier; 3] = [
    QuoteTier { offset_ticks: 0, weight: 0.5 },
    QuoteTier { offset_ticks: 1, weight: 0.3 },
    QuoteTier { offset_ticks: 2, weight: 0.2 },
];

#[derive(Debug, Clone)]
pub struct QuoteInputs<'a> {
    pub mid: f64,
    pub target_spread: f64,
    /// Inventory in the quoted outcome, shares. Negative only as a defensive
    /// input; the engine never holds short.
    pub inventory: f64,
    pub skew_factor: f64,
    pub order_size: f64,
    pub max_inventory: f64,
    pub grid: &'a PriceGrid,
    pub policy: QuotingPolicy,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    /// Average acquisition cost; 0 when flat.
    pub avg_cost: f64,
    pub bid_offset_ticks: Option<u32>,
    pub ask_offset_ticks: Option<u32>,
    pub tiers: &'a [QuoteTier],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DesiredQuote {
    pub tier: u32,
    pub price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, Default)]
pub struct QuoteSet {
    pub bids: Vec<DesiredQuote>,
    pub asks: Vec<DesiredQuote>,
    pub reduce_only: bool,
}

impl QuoteSet {
    pub fn top_bid(&self) -> Option<&DesiredQuote> {
        self.bids.first()
    }

    pub fn top_ask(&self) -> Option<&DesiredQuote> {
        self.asks.first()
    }
}

/// Compute the desired quote for one outcome.
pub fn compute(inp: &QuoteInputs<'_>) -> QuoteSet {
    let tick = inp.grid.tick_size(inp.mid);

    // 1–2. Inventory-normalised skew off the theoretical mid quote.
    let inv_norm = if inp.max_inventory > 0.0 {
        (inp.inventory / inp.max_inventory).clamp(-1.0, 1.0)
    } else {
        0.0
    };
    let skew = inp.skew_factor * inv_norm;
    let mut bid = inp.mid - inp.target_spread / 2.0 - skew;
    let mut ask = inp.mid + inp.target_spread / 2.0 - skew;

    // 3. Policy adjustment against the touch.
    match inp.policy {
        QuotingPolicy::Touch => {
            if let Some(bb) = inp.best_bid {
                bid = bid.min(bb);
            }
            if let Some(ba) = inp.best_ask {
                ask = ask.max(ba);
            }
        }
        QuotingPolicy::Inside => match (inp.best_bid, inp.best_ask) {
            (Some(bb), Some(ba)) if ba - bb > tick + 1e-12 => {
                bid = bid.max(bb + tick);
                ask = ask.min(ba - tick);
            }
            _ => {
                // No room inside the spread: behave like touch.
                if let Some(bb) = inp.best_bid {
                    bid = bid.min(bb);
                }
                if let Some(ba) = inp.best_ask {
                    ask = ask.max(ba);
                }
            }
        },
        QuotingPolicy::Back => {}
        QuotingPolicy::Defensive => {
            if let Some(bb) = inp.best_bid {
                bid = bid.min(bb);
            }
            if let Some(ba) = inp.best_ask {
                ask = ba;
            }
            if inp.avg_cost > 0.0 {
                ask = ask.max(inp.avg_cost + tick);
            }
        }
        QuotingPolicy::Offsets | QuotingPolicy::Tiered => {
            if let (Some(bb), Some(off)) = (inp.best_bid, inp.bid_offset_ticks) {
                bid = bb - off as f64 * tick;
            }
            if let (Some(ba), Some(off)) = (inp.best_ask, inp.ask_offset_ticks) {
                ask = ba + off as f64 * tick;
            }
        }
    }

    // Never offer below cost.
    if inp.avg_cost > 0.0 {
        ask = ask.max(inp.avg_cost + tick);
    }

    // 4. Grid + band, and keep the two sides apart.
    let mut bid = inp.grid.quantize(bid, QuantizeMode::Floor);
    let mut ask = inp.grid.quantize(ask, QuantizeMode::Ceil);
    if ask <= bid {
        ask = inp.grid.quantize(bid + tick, QuantizeMode::Ceil);
        if ask <= bid {
            // Pinned at the top of the band: step the bid down instead.
            bid = inp.grid.quantize(ask - tick, QuantizeMode::Floor);
        }
    }

    // 5. Near the cap, only quotes that shrink inventory survive.
    let reduce_only = inv_norm.abs() >= 0.9;

    // 6. Sizing.
    let ask_size = if inp.inventory <= 0.0 {
        0.0 // cannot sell what you don't own
    } else {
        inp.inventory
            .min((3.0 * inp.order_size).max(inp.inventory / 2.0))
    };
    let mut bid_size = inp.order_size;
    let mut ask_size = ask_size;
    if inv_norm >= 0.9 {
        bid_size = 0.0;
    }
    if inv_norm <= -0.9 {
        ask_size = 0.0;
    }

    match inp.policy {
        QuotingPolicy::Tiered => {
            tiered(inp, bid, ask, bid_size, ask_size, tick, reduce_only)
        }
        _ => {
            let mut set = QuoteSet {
                reduce_only,
                ..Default::default()
            };
            if bid_size > 0.0 {
                set.bids.push(DesiredQuote { tier: 0, price: bid, size: bid_size });
            }
            if ask_size > 0.0 {
                set.asks.push(DesiredQuote { tier: 0, price: ask, size: ask_size });
            }
            set
        }
    }
}

/// Spread the per-side size across the configured tiers, stepping each
/// level one offset further from the inside.
fn tiered(
    inp: &QuoteInputs<'_>,
    bid: f64,
    ask: f64,
    bid_size: f64,
    ask_size: f64,
    tick: f64,
    reduce_only: bool,
) -> QuoteSet {
    let tiers = if inp.tiers.is_empty() { &DEFAULT_TIERS[..] } else { inp.tiers };
    let mut set = QuoteSet {
        reduce_only,
        ..Default::default()
    };
    for (i, t) in tiers.iter().enumerate() {
        let off = t.offset_ticks as f64 * tick;
        if bid_size > 0.0 {
            let p = inp.grid.quantize(bid - off, QuantizeMode::Floor);
            let s = bid_size * t.weight;
            if s > 0.0 {
                set.bids.push(DesiredQuote { tier: i as u32, price: p, size: s });
            }
        }
        if ask_size > 0.0 {
            let p = inp.grid.quantize(ask + off, QuantizeMode::Ceil);
            let s = ask_size * t.weight;
            if s > 0.0 {
                set.asks.push(DesiredQuote { tier: i as u32, price: p, size: s });
            }
        }
    }
    set
}
