//! Reconnect and liveness state machines for the client transport.
//!
//! Both machines are pure: they take the current time from a [`Clock`] and
//! tell the driver what to do next. The driver owns the sockets and timers.
//!
//! ```text
//!            start()             on_synced()
//!   Idle ────────────► Connecting ───────────► Connected
//!                         ▲   │                    │
//!              on_retry() │   │ on_failure()       │ on_failure()
//!                         │   ▼                    │
//!                        Waiting ◄─────────────────┘
//! ```
//!
//! # Backoff Schedule (defaults)
//!
//! ```text
//! Failure  Delay
//! -------  -----
//! 1        100ms
//! 2        200ms
//! 3        400ms
//! 4        800ms
//! 5        1.6s
//! 6+       2.5s (cap, retries forever)
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn wall_time(&self) -> SystemTime;
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    wall_base: SystemTime,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            wall_base: SystemTime::UNIX_EPOCH,
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }

    fn offset(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset()
    }

    fn wall_time(&self) -> SystemTime {
        self.wall_base + self.offset()
    }
}

/// Connection status published to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// First connection attempt in progress.
    Connecting,
    /// Handshake with the relay completed.
    Connected,
    /// No usable connection; retrying in the background.
    Disconnected,
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure.
    pub backoff_factor: f64,
    /// Timeout for a single WebSocket connect.
    pub connection_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(2500),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    /// Short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(2),
        }
    }

    /// Delay before retrying after `failures` consecutive failures (0-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// What the transport driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Open a connection now.
    Connect,
    /// Sleep this long, then call [`ReconnectMachine::on_retry`].
    RetryAfter(Duration),
    /// Stop the transport.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectState {
    Idle,
    Connecting,
    Connected,
    Waiting { retry_at: Instant },
    Stopped,
}

/// Tracks connection attempts and computes the retry schedule.
#[derive(Debug)]
pub struct ReconnectMachine {
    config: BackoffConfig,
    state: ReconnectState,
    status: ConnectionStatus,
    failures: u32,
}

impl ReconnectMachine {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: ReconnectState::Idle,
            status: ConnectionStatus::Connecting,
            failures: 0,
        }
    }

    pub fn state(&self) -> ReconnectState {
        self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Consecutive failed attempts since the last successful handshake.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn start(&mut self) -> ReconnectAction {
        match self.state {
            ReconnectState::Idle => {
                self.state = ReconnectState::Connecting;
                ReconnectAction::Connect
            }
            ReconnectState::Stopped => ReconnectAction::Stop,
            _ => ReconnectAction::Connect,
        }
    }

    /// The relay answered our handshake.
    pub fn on_synced(&mut self) {
        if self.state == ReconnectState::Stopped {
            return;
        }
        self.state = ReconnectState::Connected;
        self.status = ConnectionStatus::Connected;
        self.failures = 0;
    }

    /// A connect attempt failed or an established connection was lost.
    pub fn on_failure(&mut self, now: Instant) -> ReconnectAction {
        if self.state == ReconnectState::Stopped {
            return ReconnectAction::Stop;
        }
        let delay = self.config.delay_for(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.state = ReconnectState::Waiting {
            retry_at: now + delay,
        };
        self.status = ConnectionStatus::Disconnected;
        ReconnectAction::RetryAfter(delay)
    }

    pub fn retry_due(&self, now: Instant) -> bool {
        matches!(self.state, ReconnectState::Waiting { retry_at } if now >= retry_at)
    }

    /// The backoff delay elapsed.
    pub fn on_retry(&mut self, now: Instant) -> ReconnectAction {
        match self.state {
            ReconnectState::Stopped => ReconnectAction::Stop,
            ReconnectState::Waiting { retry_at } if now < retry_at => {
                ReconnectAction::RetryAfter(retry_at - now)
            }
            _ => {
                self.state = ReconnectState::Connecting;
                ReconnectAction::Connect
            }
        }
    }

    pub fn stop(&mut self) -> ReconnectAction {
        self.state = ReconnectState::Stopped;
        self.status = ConnectionStatus::Disconnected;
        ReconnectAction::Stop
    }
}

/// Result of one liveness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    NotDue,
    /// Connected; `last_synced` moved to this time.
    Refreshed(SystemTime),
    /// Not connected; nothing to refresh.
    Offline,
}

/// Periodic "are we still connected" check.
///
/// A poll that arrives late fires once and schedules the next check a full
/// interval later; missed periods never queue up.
#[derive(Debug)]
pub struct LivenessProbe {
    interval: Duration,
    next_due: Instant,
    last_synced: Option<SystemTime>,
}

impl LivenessProbe {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next_due: now + interval,
            last_synced: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn last_synced(&self) -> Option<SystemTime> {
        self.last_synced
    }

    /// Record a completed handshake.
    pub fn mark_synced(&mut self, at: SystemTime) {
        self.last_synced = Some(at);
    }

    pub fn poll(&mut self, clock: &dyn Clock, status: ConnectionStatus) -> ProbeOutcome {
        let now = clock.now();
        if now < self.next_due {
            return ProbeOutcome::NotDue;
        }
        self.next_due = now + self.interval;

        match status {
            ConnectionStatus::Connected => {
                let at = clock.wall_time();
                self.last_synced = Some(at);
                ProbeOutcome::Refreshed(at)
            }
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {
                ProbeOutcome::Offline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_default_backoff_schedule() {
        let config = BackoffConfig::default();
        let delays: Vec<Duration> = (0..7).map(|n| config.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1600), ms(2500), ms(2500)]
        );
        assert_eq!(config.delay_for(u32::MAX), ms(2500));
    }

    #[test]
    fn test_machine_initial_connect() {
        let mut machine = ReconnectMachine::new(BackoffConfig::default());
        assert_eq!(machine.state(), ReconnectState::Idle);
        assert_eq!(machine.status(), ConnectionStatus::Connecting);

        assert_eq!(machine.start(), ReconnectAction::Connect);
        assert_eq!(machine.state(), ReconnectState::Connecting);

        machine.on_synced();
        assert_eq!(machine.status(), ConnectionStatus::Connected);
        assert_eq!(machine.failures(), 0);
    }

    #[test]
    fn test_failures_back_off_and_reset_on_sync() {
        let clock = ManualClock::new();
        let mut machine = ReconnectMachine::new(BackoffConfig::default());
        machine.start();

        assert_eq!(machine.on_failure(clock.now()), ReconnectAction::RetryAfter(ms(100)));
        assert_eq!(machine.status(), ConnectionStatus::Disconnected);
        assert!(!machine.retry_due(clock.now()));

        clock.advance(ms(100));
        assert!(machine.retry_due(clock.now()));
        assert_eq!(machine.on_retry(clock.now()), ReconnectAction::Connect);
        assert_eq!(machine.on_failure(clock.now()), ReconnectAction::RetryAfter(ms(200)));

        clock.advance(ms(200));
        machine.on_retry(clock.now());
        machine.on_synced();
        assert_eq!(machine.status(), ConnectionStatus::Connected);

        // Losing an established connection starts the schedule over.
        assert_eq!(machine.on_failure(clock.now()), ReconnectAction::RetryAfter(ms(100)));
    }

    #[test]
    fn test_early_retry_waits_for_remainder() {
        let clock = ManualClock::new();
        let mut machine = ReconnectMachine::new(BackoffConfig::default());
        machine.start();
        machine.on_failure(clock.now());

        clock.advance(ms(30));
        assert_eq!(machine.on_retry(clock.now()), ReconnectAction::RetryAfter(ms(70)));
    }

    #[test]
    fn test_stop_is_final() {
        let clock = ManualClock::new();
        let mut machine = ReconnectMachine::new(BackoffConfig::default());
        machine.start();
        assert_eq!(machine.stop(), ReconnectAction::Stop);
        assert_eq!(machine.on_failure(clock.now()), ReconnectAction::Stop);
        assert_eq!(machine.on_retry(clock.now()), ReconnectAction::Stop);
        assert_eq!(machine.start(), ReconnectAction::Stop);
        machine.on_synced();
        assert_eq!(machine.state(), ReconnectState::Stopped);
    }

    #[test]
    fn test_probe_refreshes_only_when_connected() {
        let clock = ManualClock::new();
        let mut probe = LivenessProbe::new(Duration::from_secs(60), clock.now());

        assert_eq!(probe.poll(&clock, ConnectionStatus::Connected), ProbeOutcome::NotDue);

        clock.advance(Duration::from_secs(60));
        let outcome = probe.poll(&clock, ConnectionStatus::Connected);
        assert_eq!(outcome, ProbeOutcome::Refreshed(clock.wall_time()));
        assert_eq!(probe.last_synced(), Some(clock.wall_time()));

        clock.advance(Duration::from_secs(60));
        let before = probe.last_synced();
        assert_eq!(probe.poll(&clock, ConnectionStatus::Disconnected), ProbeOutcome::Offline);
        assert_eq!(probe.last_synced(), before);
    }

    #[test]
    fn test_probe_missed_periods_fire_once() {
        let clock = ManualClock::new();
        let mut probe = LivenessProbe::new(Duration::from_secs(60), clock.now());

        clock.advance(Duration::from_secs(600));
        assert!(matches!(
            probe.poll(&clock, ConnectionStatus::Connected),
            ProbeOutcome::Refreshed(_)
        ));
        assert_eq!(probe.poll(&clock, ConnectionStatus::Connected), ProbeOutcome::NotDue);
        assert_eq!(probe.next_due(), clock.now() + Duration::from_secs(60));
    }

    #[test]
    fn test_mark_synced() {
        let clock = ManualClock::new();
        let mut probe = LivenessProbe::new(LivenessProbe::DEFAULT_INTERVAL, clock.now());
        assert!(probe.last_synced().is_none());
        probe.mark_synced(clock.wall_time());
        assert_eq!(probe.last_synced(), Some(SystemTime::UNIX_EPOCH));
    }
}
