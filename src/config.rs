//! Process configuration.
//!
//! Two layers:
//! - `EngineConfig`: static process wiring read from the environment once at
//!   startup (endpoints, credentials, db path, bind address). Missing
//!   required secrets outside dry-run is a `ConfigError` and exits.
//! - `RuntimeSettings`: the operator-tunable switch set. Seeded from the
//!   environment on first run, persisted in the store's `settings` table,
//!   and re-read at the top of every scheduled cycle so toggles like
//!   `kill_switch_active` take effect without a restart.

use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};
use crate::types::QuotingPolicy;

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v != "0" && !v.eq_ignore_ascii_case("false"),
        Err(_) => default,
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ─────────────────────────────────────────────────────────
// Static wiring
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// Wallet key for the decimal CLOB venue; signer key id for the cent venue.
    pub wallet_key: String,
}

impl VenueCredentials {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() && self.api_secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub api_bind: String,
    pub dry_run: bool,
    pub rpc_timeout_secs: u64,
    pub clob_rest_url: String,
    pub clob_ws_url: String,
    pub clob_creds: VenueCredentials,
    pub cent_rest_url: String,
    pub cent_creds: VenueCredentials,
    /// Instance name used as the advisory-lock holder id.
    pub instance: String,
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        let dry_run = env_bool("MM_DRY_RUN", true);
        let clob_creds = VenueCredentials {
            api_key: env_str("CLOB_API_KEY", ""),
            api_secret: env_str("CLOB_API_SECRET", ""),
            api_passphrase: env_str("CLOB_API_PASSPHRASE", ""),
            wallet_key: env_str("CLOB_WALLET_KEY", ""),
        };
        let cent_creds = VenueCredentials {
            api_key: env_str("CENT_API_KEY_ID", ""),
            api_secret: env_str("CENT_API_SECRET", ""),
            api_passphrase: String::new(),
            wallet_key: String::new(),
        };

        if !dry_run && clob_creds.is_empty() && cent_creds.is_empty() {
            return Err(EngineError::config(
                "live mode requires venue credentials (set MM_DRY_RUN=1 for paper trading)",
            ));
        }

        Ok(Self {
            db_path: env_str("MM_DB_PATH", "pm_quoter.db"),
            api_bind: env_str("MM_API_BIND", "127.0.0.1:8787"),
            dry_run,
            rpc_timeout_secs: env_u64("MM_RPC_TIMEOUT_SECS", 15),
            clob_rest_url: env_str("CLOB_REST_URL", "https://clob.example.com"),
            clob_ws_url: env_str("CLOB_WS_URL", "wss://ws.clob.example.com/ws"),
            clob_creds,
            cent_rest_url: env_str("CENT_REST_URL", "https://api.cent.example.com"),
            cent_creds,
            instance: env_str("MM_INSTANCE", "quoter-1"),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Runtime settings (reloaded each cycle)
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Global quoting switch.
    pub mm_enabled: bool,
    /// Blocks all scheduled jobs.
    pub kill_switch_active: bool,

    pub mm_default_spread: f64,
    pub mm_default_order_size: f64,
    pub mm_default_max_inventory: f64,
    pub mm_default_skew_factor: f64,
    pub mm_default_quoting_policy: QuotingPolicy,
    /// Fractional mid move that forces an immediate requote.
    pub mm_refresh_threshold: f64,
    /// Hours before end-time at which quoting halts.
    pub mm_min_time_to_resolution: f64,

    /// Job cadences, seconds.
    pub scan_interval_secs: u64,
    pub mm_interval_secs: u64,
    pub sync_interval_secs: u64,
    pub inventory_sync_interval_secs: u64,
    pub mm_candidates_interval_secs: u64,

    /// Screening gates for the candidate scanner.
    pub min_prob: f64,
    pub max_prob: f64,
    pub max_spread_ticks: u32,
    pub min_liquidity: f64,

    pub candidate_ttl_hours: f64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            mm_enabled: true,
            kill_switch_active: false,
            mm_default_spread: 0.02,
            mm_default_order_size: 10.0,
            mm_default_max_inventory: 100.0,
            mm_default_skew_factor: 0.02,
            mm_default_quoting_policy: QuotingPolicy::Back,
            mm_refresh_threshold: 0.01,
            mm_min_time_to_resolution: 6.0,
            scan_interval_secs: 300,
            mm_interval_secs: 5,
            sync_interval_secs: 3600,
            inventory_sync_interval_secs: 10,
            mm_candidates_interval_secs: 86_400,
            min_prob: 0.05,
            max_prob: 0.95,
            max_spread_ticks: 10,
            min_liquidity: 250.0,
            candidate_ttl_hours: 36.0,
        }
    }
}

impl RuntimeSettings {
    /// Environment seed: defaults plus per-key overrides.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            mm_enabled: env_bool("MM_ENABLED", d.mm_enabled),
            kill_switch_active: env_bool("MM_KILL_SWITCH", d.kill_switch_active),
            mm_default_spread: env_f64("MM_DEFAULT_SPREAD", d.mm_default_spread),
            mm_default_order_size: env_f64("MM_DEFAULT_ORDER_SIZE", d.mm_default_order_size),
            mm_default_max_inventory: env_f64("MM_DEFAULT_MAX_INVENTORY", d.mm_default_max_inventory),
            mm_default_skew_factor: env_f64("MM_DEFAULT_SKEW_FACTOR", d.mm_default_skew_factor),
            mm_default_quoting_policy: std::env::var("MM_DEFAULT_QUOTING_POLICY")
                .ok()
                .and_then(|v| QuotingPolicy::from_str_loose(&v))
                .unwrap_or(d.mm_default_quoting_policy),
            mm_refresh_threshold: env_f64("MM_REFRESH_THRESHOLD", d.mm_refresh_threshold),
            mm_min_time_to_resolution: env_f64("MM_MIN_TIME_TO_RESOLUTION", d.mm_min_time_to_resolution),
            scan_interval_secs: env_u64("MM_SCAN_INTERVAL", d.scan_interval_secs),
            mm_interval_secs: env_u64("MM_INTERVAL", d.mm_interval_secs),
            sync_interval_secs: env_u64("MM_SYNC_INTERVAL", d.sync_interval_secs),
            inventory_sync_interval_secs: env_u64(
                "MM_INVENTORY_SYNC_INTERVAL",
                d.inventory_sync_interval_secs,
            ),
            mm_candidates_interval_secs: env_u64(
                "MM_CANDIDATES_INTERVAL",
                d.mm_candidates_interval_secs,
            ),
            min_prob: env_f64("MM_MIN_PROB", d.min_prob),
            max_prob: env_f64("MM_MAX_PROB", d.max_prob),
            max_spread_ticks: env_u64("MM_MAX_SPREAD_TICKS", d.max_spread_ticks as u64) as u32,
            min_liquidity: env_f64("MM_MIN_LIQUIDITY", d.min_liquidity),
            candidate_ttl_hours: env_f64("MM_CANDIDATE_TTL_HOURS", d.candidate_ttl_hours),
        }
    }

    /// Default per-MM config stamped onto newly enrolled markets.
    pub fn default_mm_config(&self) -> crate::types::MmConfig {
        crate::types::MmConfig {
            target_spread: self.mm_default_spread,
            skew_factor: self.mm_default_skew_factor,
            order_size: self.mm_default_order_size,
            max_inventory: self.mm_default_max_inventory,
            policy: self.mm_default_quoting_policy,
            min_time_to_resolution_hours: self.mm_min_time_to_resolution,
            bid_offset_ticks: None,
            ask_offset_ticks: None,
            tiers: None,
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.mm_interval_secs == 0 || self.inventory_sync_interval_secs == 0 {
            return Err(EngineError::config("intervals must be non-zero"));
        }
        if !(0.0 < self.min_prob && self.min_prob < self.max_prob && self.max_prob < 1.0) {
            return Err(EngineError::config(format!(
                "bad probability band [{}, {}]",
                self.min_prob, self.max_prob
            )));
        }
        if self.mm_default_spread <= 0.0 || self.mm_default_max_inventory <= 0.0 {
            return Err(EngineError::config("spread and max inventory must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeSettings::default().validate().is_ok());
    }

    #[test]
    fn test_bad_band_rejected() {
        let mut s = RuntimeSettings::default();
        s.min_prob = 0.9;
        s.max_prob = 0.1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut s = RuntimeSettings::default();
        s.mm_interval_secs = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_default_mm_config_stamp() {
        let s = RuntimeSettings::default();
        let c = s.default_mm_config();
        assert!((c.target_spread - s.mm_default_spread).abs() < 1e-12);
        assert_eq!(c.policy, s.mm_default_quoting_policy);
    }
}
