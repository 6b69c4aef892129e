//! Snowflake identifier generation.
//!
//! An identifier packs, from the most significant bit:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────┬─────────────┐
//! │ 41 bits: ms since 2024-01-01 │ 16 bits: machine │ 7 bits: seq │
//! └──────────────────────────────┴──────────────────┴─────────────┘
//! ```
//!
//! and renders as 16 lowercase hex digits. One generator never returns the
//! same value twice, and the timestamp component never decreases, even if the
//! wall clock is stepped backward:
//!
//! - a backward step within the drift tolerance waits for the clock to catch up
//! - a larger step keeps the last timestamp instead of blocking, and logs an
//!   error; once its sequence runs out the timestamp advances by one
//!   millisecond without waiting
//! - otherwise, exhausting the per-millisecond sequence waits for the next
//!   millisecond

use crate::logger::Logger;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Generator epoch: 2024-01-01T00:00:00Z in Unix milliseconds.
pub const EPOCH_MS: u64 = 1_704_067_200_000;

const TIMESTAMP_SHIFT: u32 = 23;
const MACHINE_SHIFT: u32 = 7;
const MACHINE_MASK: u64 = 0xFFFF;
const MAX_SEQUENCE: u64 = 0x7F;
const TIMESTAMP_MASK: u64 = (1 << 41) - 1;

/// Spins before each wait falls back to sleeping.
const SPIN_LIMIT: u32 = 1_000;
const WAIT_SLEEP: Duration = Duration::from_micros(100);

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> SystemTime;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl<F> Clock for F
where
    F: Fn() -> SystemTime + Send + Sync + 'static,
{
    fn now(&self) -> SystemTime {
        self()
    }
}

/// Generator settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SnowflakeConfig {
    /// Largest backward clock step, in milliseconds, that is waited out.
    pub drift_tolerance_ms: u64,

    /// Explicit machine id; derived from the hostname when unset.
    pub machine_id: Option<u16>,
}

impl Default for SnowflakeConfig {
    fn default() -> Self {
        Self {
            drift_tolerance_ms: 500,
            machine_id: None,
        }
    }
}

/// A decoded snowflake identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnowflakeId(u64);

impl SnowflakeId {
    /// Assembles an identifier from its parts. Out-of-range parts are masked.
    pub const fn from_parts(timestamp_ms: u64, machine_id: u16, sequence: u8) -> Self {
        Self(
            ((timestamp_ms & TIMESTAMP_MASK) << TIMESTAMP_SHIFT)
                | ((machine_id as u64) << MACHINE_SHIFT)
                | (sequence as u64 & MAX_SEQUENCE),
        )
    }

    /// The raw 64-bit value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Milliseconds since [`EPOCH_MS`].
    pub const fn timestamp_ms(self) -> u64 {
        self.0 >> TIMESTAMP_SHIFT
    }

    /// The machine component.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn machine_id(self) -> u16 {
        ((self.0 >> MACHINE_SHIFT) & MACHINE_MASK) as u16
    }

    /// The per-millisecond sequence.
    #[allow(clippy::cast_possible_truncation)]
    pub const fn sequence(self) -> u8 {
        (self.0 & MAX_SEQUENCE) as u8
    }
}

impl From<u64> for SnowflakeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Error parsing a [`SnowflakeId`] from text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid snowflake id {0:?}: expected 16 hex digits")]
pub struct ParseSnowflakeError(String);

impl FromStr for SnowflakeId {
    type Err = ParseSnowflakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseSnowflakeError(s.to_string()));
        }
        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| ParseSnowflakeError(s.to_string()))
    }
}

#[derive(Debug)]
struct State {
    last_ms: u64,
    sequence: u64,
}

/// Thread-safe snowflake generator.
pub struct SnowflakeGenerator {
    clock: Box<dyn Clock>,
    machine_id: u16,
    drift_tolerance_ms: u64,
    state: Mutex<State>,
    logger: Logger,
}

impl fmt::Debug for SnowflakeGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnowflakeGenerator")
            .field("machine_id", &self.machine_id)
            .field("drift_tolerance_ms", &self.drift_tolerance_ms)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SnowflakeGenerator {
    /// Creates a generator on the system clock with default settings.
    pub fn new(logger: Logger) -> Self {
        Self::from_config(&SnowflakeConfig::default(), logger)
    }

    /// Creates a generator on the system clock.
    pub fn from_config(config: &SnowflakeConfig, logger: Logger) -> Self {
        Self::with_clock(config, SystemClock, logger)
    }

    /// Creates a generator reading time from `clock`.
    pub fn with_clock(config: &SnowflakeConfig, clock: impl Clock, logger: Logger) -> Self {
        let machine_id = config
            .machine_id
            .unwrap_or_else(|| hostname_machine_id(&logger));
        Self {
            clock: Box::new(clock),
            machine_id,
            drift_tolerance_ms: config.drift_tolerance_ms,
            state: Mutex::new(State {
                last_ms: 0,
                sequence: 0,
            }),
            logger,
        }
    }

    /// The machine component stamped into every identifier.
    pub fn machine_id(&self) -> u16 {
        self.machine_id
    }

    /// Returns the next identifier as 16 hex digits.
    pub fn generate(&self) -> String {
        self.next_id().to_string()
    }

    /// Returns the next identifier.
    pub fn next_id(&self) -> SnowflakeId {
        let mut state = self.state.lock();
        let mut now = self.current_ms();
        let mut clock_behind = false;

        if now < state.last_ms {
            let drift = state.last_ms - now;
            if drift <= self.drift_tolerance_ms {
                now = self.wait_until(state.last_ms);
            } else {
                self.logger.scope(|| {
                    tracing::error!(
                        drift_ms = drift,
                        tolerance_ms = self.drift_tolerance_ms,
                        "clock moved backwards beyond tolerance, holding last timestamp"
                    );
                });
                now = state.last_ms;
                clock_behind = true;
            }
        }

        if now == state.last_ms {
            state.sequence += 1;
            if state.sequence > MAX_SEQUENCE {
                // No waiting while the wall clock is behind.
                now = if clock_behind {
                    state.last_ms + 1
                } else {
                    self.wait_until(state.last_ms + 1)
                };
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }

        state.last_ms = now;

        #[allow(clippy::cast_possible_truncation)]
        let sequence = state.sequence as u8;
        SnowflakeId::from_parts(now, self.machine_id, sequence)
    }

    fn current_ms(&self) -> u64 {
        let since_unix = self
            .clock
            .now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        u64::try_from(since_unix.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_sub(EPOCH_MS)
    }

    /// Re-reads the clock until it reaches `target`.
    fn wait_until(&self, target: u64) -> u64 {
        let mut spins = 0;
        loop {
            let now = self.current_ms();
            if now >= target {
                return now;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::sleep(WAIT_SLEEP);
            }
        }
    }
}

/// FNV-1a of the hostname, masked to 16 bits.
fn hostname_machine_id(logger: &Logger) -> u16 {
    let name = match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            logger.scope(|| {
                tracing::error!(error = %e, "failed to read hostname, using empty machine identity");
            });
            String::new()
        }
    };
    machine_id_for(&name)
}

#[allow(clippy::cast_possible_truncation)]
fn machine_id_for(host: &str) -> u16 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(host.as_bytes());
    (hasher.finish() & MACHINE_MASK) as u16
}
