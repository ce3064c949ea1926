//! The sanity gate: seven independent checks run before every quote cycle.
//!
//! One failing check means no quoting for that market this cycle: no
//! cancels, no places. The gate is total: any input yields OK or exactly
//! one reason code (the first failing check in order). YES and NO are
//! gated independently; either failure halts the market's cycle.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::types::Outcome;

// Gate constants.
pub const MID_FLOOR: f64 = 0.05;
pub const MID_CEIL: f64 = 0.95;
pub const MAX_SPREAD_TICKS: f64 = 50.0;
pub const MAX_STORED_AGE_MINUTES: i64 = 30;
pub const MIN_MID_DEVIATION: f64 = 0.03;
pub const MAX_QUOTE_IMPROVEMENT: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub enum SanityReason {
    MidOutOfRange { outcome: Outcome, mid: f64 },
    CrossedBook { outcome: Outcome, best_bid: f64, best_ask: f64 },
    SpreadTooWide { outcome: Outcome, ticks: f64 },
    StoredPriceStale { age_minutes: i64 },
    MidDeviation { outcome: Outcome, auth: f64, stored: f64, allowed: f64 },
    QuoteImprovesTooFar { outcome: Outcome, side: &'static str, price: f64, best: f64 },
    QuoteOutOfBounds { outcome: Outcome, price: f64 },
}

impl fmt::Display for SanityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanityReason::MidOutOfRange { outcome, mid } => {
                write!(f, "{} mid {:.3} outside [{MID_FLOOR}, {MID_CEIL}]", outcome.as_str(), mid)
            }
            SanityReason::CrossedBook { outcome, best_bid, best_ask } => {
                write!(f, "{} crossed book ({:.3} ≥ {:.3})", outcome.as_str(), best_bid, best_ask)
            }
            SanityReason::SpreadTooWide { outcome, ticks } => {
                write!(f, "{} spread {ticks:.0} ticks wide", outcome.as_str())
            }
            SanityReason::StoredPriceStale { age_minutes } => {
                write!(f, "Stored price {age_minutes} min old")
            }
            SanityReason::MidDeviation { outcome, auth, stored, allowed } => write!(
                f,
                "{} mid deviates: auth {:.3} vs stored {:.3} (allowed {:.3})",
                outcome.as_str(),
                auth,
                stored,
                allowed
            ),
            SanityReason::QuoteImprovesTooFar { outcome, side, price, best } => write!(
                f,
                "{} {side} {price:.3} improves best {best:.3} by more than {MAX_QUOTE_IMPROVEMENT}",
                outcome.as_str()
            ),
            SanityReason::QuoteOutOfBounds { outcome, price } => {
                write!(f, "{} quote {price:.3} outside (0, 1)", outcome.as_str())
            }
        }
    }
}

/// Market-data half of the gate (checks 1–5).
#[derive(Debug, Clone)]
pub struct DataCheckInputs {
    pub outcome: Outcome,
    /// Authoritative midpoint from the venue.
    pub auth_mid: f64,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub spread: f64,
    pub tick: f64,
    /// Mid cached on the market record, and when it was written.
    pub stored_mid: Option<f64>,
    pub stored_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Checks 1–5: refuse to quote on degraded data.
pub fn check_market_data(inp: &DataCheckInputs) -> Result<(), SanityReason> {
    // 1. Midpoint in a quotable band.
    if !(MID_FLOOR..=MID_CEIL).contains(&inp.auth_mid) {
        return Err(SanityReason::MidOutOfRange {
            outcome: inp.outcome,
            mid: inp.auth_mid,
        });
    }

    // 2. Book not crossed.
    if let (Some(bb), Some(ba)) = (inp.best_bid, inp.best_ask) {
        if bb >= ba {
            return Err(SanityReason::CrossedBook {
                outcome: inp.outcome,
                best_bid: bb,
                best_ask: ba,
            });
        }
    }

    // 3. Spread within the quotable range.
    if inp.tick > 0.0 {
        let ticks = inp.spread / inp.tick;
        if ticks > MAX_SPREAD_TICKS {
            return Err(SanityReason::SpreadTooWide {
                outcome: inp.outcome,
                ticks,
            });
        }
    }

    // 4. Stored market price fresh enough to compare against.
    let age_minutes = match inp.stored_at {
        Some(at) => (inp.now - at).num_minutes(),
        None => i64::MAX,
    };
    if age_minutes > MAX_STORED_AGE_MINUTES {
        return Err(SanityReason::StoredPriceStale {
            age_minutes: if age_minutes == i64::MAX { -1 } else { age_minutes },
        });
    }

    // 5. Authoritative vs stored deviation.
    if let Some(stored) = inp.stored_mid {
        let allowed = MIN_MID_DEVIATION.max(2.0 * inp.spread);
        if (inp.auth_mid - stored).abs() > allowed {
            return Err(SanityReason::MidDeviation {
                outcome: inp.outcome,
                auth: inp.auth_mid,
                stored,
                allowed,
            });
        }
    }

    Ok(())
}

/// Checks 6–7: the computed quote itself must be sane.
pub fn check_quotes(
    outcome: Outcome,
    bid: Option<f64>,
    ask: Option<f64>,
    best_bid: Option<f64>,
    best_ask: Option<f64>,
) -> Result<(), SanityReason> {
    // 6. Never improve the touch by more than the cap.
    if let (Some(b), Some(bb)) = (bid, best_bid) {
        if b - bb > MAX_QUOTE_IMPROVEMENT {
            return Err(SanityReason::QuoteImprovesTooFar {
                outcome,
                side: "bid",
                price: b,
                best: bb,
            });
        }
    }
    if let (Some(a), Some(ba)) = (ask, best_ask) {
        if ba - a > MAX_QUOTE_IMPROVEMENT {
            return Err(SanityReason::QuoteImprovesTooFar {
                outcome,
                side: "ask",
                price: a,
                best: ba,
            });
        }
    }

    // 7. Strictly inside (0, 1).
    for p in [bid, ask].into_iter().flatten() {
        if p <= 0.0 || p >= 1.0 {
            return Err(SanityReason::QuoteOutOfBounds { outcome, price: p });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn inputs() -> DataCheckInputs {
        let now = Utc::now();
        DataCheckInputs {
            outcome: Outcome::Yes,
            auth_mid: 0.50,
            best_bid: Some(0.49),
            best_ask: Some(0.51),
            spread: 0.02,
            tick: 0.01,
            stored_mid: Some(0.50),
            stored_at: Some(now - Duration::minutes(1)),
            now,
        }
    }

    #[test]
    fn test_clean_data_passes() {
        assert!(check_market_data(&inputs()).is_ok());
    }

    #[test]
    fn test_mid_out_of_range() {
        let mut inp = inputs();
        inp.auth_mid = 0.03;
        assert!(matches!(
            check_market_data(&inp),
            Err(SanityReason::MidOutOfRange { .. })
        ));
        inp.auth_mid = 0.97;
        assert!(check_market_data(&inp).is_err());
    }

    #[test]
    fn test_crossed_book_refusal() {
        // best_bid=0.55 ≥ best_ask=0.54 → "YES crossed book".
        let mut inp = inputs();
        inp.best_bid = Some(0.55);
        inp.best_ask = Some(0.54);
        inp.auth_mid = 0.545;
        let err = check_market_data(&inp).unwrap_err();
        assert!(matches!(err, SanityReason::CrossedBook { .. }));
        assert!(err.to_string().contains("YES crossed book"));
    }

    #[test]
    fn test_spread_too_wide() {
        let mut inp = inputs();
        inp.spread = 0.60; // 60 ticks
        inp.auth_mid = 0.50;
        assert!(matches!(
            check_market_data(&inp),
            Err(SanityReason::SpreadTooWide { .. })
        ));
    }

    #[test]
    fn test_stale_stored_price() {
        // 45 minutes old → refuse with the age in the reason.
        let mut inp = inputs();
        inp.stored_at = Some(inp.now - Duration::minutes(45));
        let err = check_market_data(&inp).unwrap_err();
        assert_eq!(err.to_string(), "Stored price 45 min old");
    }

    #[test]
    fn test_missing_stored_price_is_stale() {
        let mut inp = inputs();
        inp.stored_at = None;
        assert!(matches!(
            check_market_data(&inp),
            Err(SanityReason::StoredPriceStale { .. })
        ));
    }

    #[test]
    fn test_mid_deviation_band_scales_with_spread() {
        let mut inp = inputs();
        inp.stored_mid = Some(0.42);
        inp.auth_mid = 0.50; // 0.08 off, allowed = max(0.03, 0.04) = 0.04
        assert!(matches!(
            check_market_data(&inp),
            Err(SanityReason::MidDeviation { .. })
        ));

        // Wider spread widens the allowance.
        inp.spread = 0.05; // allowed = 0.10
        assert!(check_market_data(&inp).is_ok());
    }

    #[test]
    fn test_exactly_one_reason() {
        // Everything wrong at once: one reason comes back (the first check).
        let mut inp = inputs();
        inp.auth_mid = 0.99;
        inp.best_bid = Some(0.99);
        inp.best_ask = Some(0.01);
        inp.spread = 0.9;
        inp.stored_at = None;
        let err = check_market_data(&inp).unwrap_err();
        assert!(matches!(err, SanityReason::MidOutOfRange { .. }));
    }

    #[test]
    fn test_quote_improvement_cap() {
        let err = check_quotes(Outcome::Yes, Some(0.56), None, Some(0.50), None).unwrap_err();
        assert!(matches!(err, SanityReason::QuoteImprovesTooFar { .. }));

        // Ask improving (undercutting) beyond the cap.
        let err = check_quotes(Outcome::No, None, Some(0.44), None, Some(0.50)).unwrap_err();
        assert!(matches!(err, SanityReason::QuoteImprovesTooFar { .. }));

        assert!(check_quotes(Outcome::Yes, Some(0.54), Some(0.56), Some(0.50), Some(0.60)).is_ok());
    }

    #[test]
    fn test_quote_bounds() {
        assert!(matches!(
            check_quotes(Outcome::Yes, Some(0.0), None, None, None),
            Err(SanityReason::QuoteOutOfBounds { .. })
        ));
        assert!(matches!(
            check_quotes(Outcome::Yes, None, Some(1.0), None, None),
            Err(SanityReason::QuoteOutOfBounds { .. })
        ));
        assert!(check_quotes(Outcome::Yes, Some(0.01), Some(0.99), None, None).is_ok());
    }
}
