//! Connectivity Monitor: two-state health tracking for the primary client
//!
//! The monitor is a pure-logic state machine. The caller probes the primary
//! client (or, while degraded, tries to rebuild one) on every heartbeat and
//! feeds the outcome in; the monitor answers with the [`Transition`] the caller
//! has to act on:
//!
//! ```text
//!            probe ok                       rebuild failed
//!          ┌─────────┐                     ┌─────────┐
//!          ▼         │    probe failed     ▼         │
//!     ┌─────────┐────┘  ─────────────▶ ┌──────────┐──┘
//!     │ Healthy │                      │ Degraded │
//!     └─────────┘ ◀───────────────────  └──────────┘
//!                    rebuild verified
//! ```
//!
//! [`Reachability`] is the shared flag the caller flips alongside the
//! transitions so that other tasks can cheaply check it.
//!
//! # Example
//!
//! ```
//! use storm_core_resilience::connectivity::{
//!     ConnectivityConfig, ConnectivityMonitor, ConnectivityState, Transition,
//! };
//!
//! let mut monitor = ConnectivityMonitor::new(ConnectivityConfig::default(), ConnectivityState::Healthy);
//!
//! assert_eq!(monitor.observe(true), Transition::Steady);
//! assert_eq!(monitor.observe(false), Transition::Lost);
//! assert_eq!(monitor.observe(false), Transition::StillDown);
//! assert_eq!(monitor.observe(true), Transition::Recovered);
//! assert_eq!(monitor.state(), ConnectivityState::Healthy);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Configuration for the connectivity heartbeat
#[derive(Debug, Clone)]
pub struct ConnectivityConfig {
    /// How often the caller should probe (heartbeat interval)
    pub check_interval: Duration,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
        }
    }
}

/// Connectivity state of the primary client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    /// Primary client answers its probe
    Healthy,
    /// Primary client lost; rebuild attempted on every tick
    Degraded,
}

/// What the caller has to do after a heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Still healthy, nothing to do
    Steady,
    /// Healthy → Degraded: tear down the bulk path, mark unreachable
    Lost,
    /// Still degraded, the rebuild attempt failed
    StillDown,
    /// Degraded → Healthy: rebuild the bulk path, mark reachable, retry queued failures
    Recovered,
}

/// Shared reachability flag
#[derive(Debug, Clone)]
pub struct Reachability(Arc<AtomicBool>);

impl Reachability {
    /// Create a flag with an initial value
    pub fn new(reachable: bool) -> Self {
        Self(Arc::new(AtomicBool::new(reachable)))
    }

    /// Current value of the flag
    pub fn is_reachable(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Set the flag, returning the previous value
    pub fn set(&self, reachable: bool) -> bool {
        self.0.swap(reachable, Ordering::AcqRel)
    }
}

/// Two-state connectivity tracker
#[derive(Debug)]
pub struct ConnectivityMonitor {
    config: ConnectivityConfig,
    state: ConnectivityState,
    /// When the current state was entered
    since: Instant,
    check_count: u64,
    failed_checks: u64,
    consecutive_failures: u64,
    outages: u64,
    recoveries: u64,
}

impl ConnectivityMonitor {
    /// Create a monitor starting in `initial` state
    pub fn new(config: ConnectivityConfig, initial: ConnectivityState) -> Self {
        Self {
            config,
            state: initial,
            since: Instant::now(),
            check_count: 0,
            failed_checks: 0,
            consecutive_failures: 0,
            outages: 0,
            recoveries: 0,
        }
    }

    /// Feed one heartbeat outcome.
    ///
    /// In `Healthy`, `ok` is the primary's probe result; in `Degraded`, it is
    /// whether a replacement client was built and verified.
    pub fn observe(&mut self, ok: bool) -> Transition {
        self.check_count += 1;
        if !ok {
            self.failed_checks += 1;
            self.consecutive_failures += 1;
        }

        let transition = match (self.state, ok) {
            (ConnectivityState::Healthy, true) => Transition::Steady,
            (ConnectivityState::Healthy, false) => {
                self.outages += 1;
                self.enter(ConnectivityState::Degraded);
                Transition::Lost
            }
            (ConnectivityState::Degraded, false) => Transition::StillDown,
            (ConnectivityState::Degraded, true) => {
                self.recoveries += 1;
                self.enter(ConnectivityState::Healthy);
                Transition::Recovered
            }
        };

        if ok {
            self.consecutive_failures = 0;
        }
        transition
    }

    fn enter(&mut self, state: ConnectivityState) {
        self.state = state;
        self.since = Instant::now();
    }

    /// Current state
    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Time spent in the current state
    pub fn time_in_state(&self) -> Duration {
        self.since.elapsed()
    }

    /// Get monitoring statistics
    pub fn stats(&self) -> ConnectivityStats {
        ConnectivityStats {
            check_count: self.check_count,
            failed_checks: self.failed_checks,
            consecutive_failures: self.consecutive_failures,
            outages: self.outages,
            recoveries: self.recoveries,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }
}

/// Statistics for the connectivity monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityStats {
    /// Heartbeats observed
    pub check_count: u64,
    /// Heartbeats whose probe or rebuild failed
    pub failed_checks: u64,
    /// Failed heartbeats since the last success
    pub consecutive_failures: u64,
    /// Healthy → Degraded transitions
    pub outages: u64,
    /// Degraded → Healthy transitions
    pub recoveries: u64,
}
