//! Unwinder configuration parameters.
//!
//! Resolved once at startup; the walker, session and driver read these
//! without any per-frame cost.

use std::env;
use std::str::FromStr;

// =============================================================================
// Environment Keys
// =============================================================================

/// Maximum traceback entries recorded per unwind episode.
pub const ENV_TRACEBACK_LIMIT: &str = "PRISM_UNWIND_TRACEBACK_LIMIT";
/// Per-statement exception count that flags a statement for promotion.
pub const ENV_PROMOTION_THRESHOLD: &str = "PRISM_UNWIND_PROMOTION_THRESHOLD";
/// Whether landing pads are bounds-checked before resuming.
pub const ENV_VERIFY_LANDING_PADS: &str = "PRISM_UNWIND_VERIFY_LANDING_PADS";
/// Upper bound on physical frames stepped by one walk.
pub const ENV_MAX_WALK_DEPTH: &str = "PRISM_UNWIND_MAX_WALK_DEPTH";

// =============================================================================
// UnwindConfig
// =============================================================================

/// Configuration for stack walking and exception unwinding.
///
/// # Example
///
/// ```
/// use prism_unwind::UnwindConfig;
///
/// let config = UnwindConfig {
///     traceback_limit: 64,
///     ..Default::default()
/// };
/// assert!(config.verify_landing_pads);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindConfig {
    /// Maximum traceback entries accumulated during one episode.
    ///
    /// Frames past the limit are still unwound and cleaned up, they just
    /// stop contributing lines.
    ///
    /// Default: 0 (unlimited)
    pub traceback_limit: usize,

    /// Number of exceptions a single statement may see before it is
    /// reported as a tier-promotion candidate.
    ///
    /// Default: 100
    pub promotion_threshold: u32,

    /// Reject landing pads that fall outside the owning code region.
    ///
    /// Default: true
    pub verify_landing_pads: bool,

    /// Maximum number of physical frames a single walk will step.
    ///
    /// Default: 100_000
    pub max_walk_depth: usize,

    /// Include the code region table in fatal diagnostic dumps.
    ///
    /// Default: true
    pub dump_regions_on_fatal: bool,
}

impl Default for UnwindConfig {
    fn default() -> Self {
        Self {
            traceback_limit: 0,
            promotion_threshold: 100,
            verify_landing_pads: true,
            max_walk_depth: 100_000,
            dump_regions_on_fatal: true,
        }
    }
}

impl UnwindConfig {
    /// Resolve configuration from `PRISM_UNWIND_*` environment variables.
    ///
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            traceback_limit: parse_or(&lookup, ENV_TRACEBACK_LIMIT, defaults.traceback_limit),
            promotion_threshold: parse_or(
                &lookup,
                ENV_PROMOTION_THRESHOLD,
                defaults.promotion_threshold,
            ),
            verify_landing_pads: lookup(ENV_VERIFY_LANDING_PADS)
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.verify_landing_pads),
            max_walk_depth: parse_or(&lookup, ENV_MAX_WALK_DEPTH, defaults.max_walk_depth),
            dump_regions_on_fatal: defaults.dump_regions_on_fatal,
        }
    }

    /// Whether another traceback entry fits under the limit.
    #[inline]
    pub fn traceback_has_room(&self, current_len: usize) -> bool {
        self.traceback_limit == 0 || current_len < self.traceback_limit
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("ignoring unparsable {key}={raw:?}");
                default
            }
        },
        None => default,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Tests
// =============================================================================
