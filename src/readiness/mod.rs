//! Bounded polling for a machine to reach a known-good state.
//!
//! The poller moves through [`ReadinessState`]: it starts `Unknown`, records
//! a deadline on entering `Polling`, and ends either `Ready` or `TimedOut`.
//! The deadline is its own timer, checked ahead of every tick and raced
//! against every probe, so a fast tick can never starve the timeout.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::debug;

use crate::error::ProviderError;
use crate::machines::{MachineHandle, MachinesApi};

/// Default time between state probes.
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default upper bound on the whole wait.
pub const READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Progress of one readiness wait.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadinessState {
    /// Not yet started.
    Unknown,
    /// Probing until the deadline.
    Polling {
        /// Instant after which the wait gives up.
        deadline: Instant,
    },
    /// A known-good state was observed.
    Ready,
    /// The deadline passed first.
    TimedOut,
}

/// Polls machine state until it is known-good or a deadline elapses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessPoller {
    interval: Duration,
    timeout: Duration,
}

impl Default for ReadinessPoller {
    fn default() -> Self {
        Self::new(READY_POLL_INTERVAL, READY_TIMEOUT)
    }
}

impl ReadinessPoller {
    /// Creates a poller probing every `interval` for at most `timeout`.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Probe interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Overall deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits until the machine named `machine_name` in `app` is in one of
    /// [`crate::machines::MachineState::KNOWN_GOOD`].
    ///
    /// The first probe runs immediately; later probes follow each tick.
    /// Lookup errors, including a machine not yet listed, count as "not
    /// ready" and polling continues.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Timeout`] once the deadline elapses.
    pub async fn wait_until_ready<A>(
        &self,
        api: &A,
        app: &str,
        machine_name: &str,
    ) -> Result<MachineHandle, ProviderError>
    where
        A: MachinesApi + ?Sized,
    {
        let mut state = ReadinessState::Unknown;
        debug!(app, machine = machine_name, ?state, "readiness wait starting");
        let started = Instant::now();
        let deadline = started + self.timeout;
        state = ReadinessState::Polling { deadline };
        debug!(app, machine = machine_name, ?state, "polling machine state");

        let expiry = sleep_until(deadline);
        tokio::pin!(expiry);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                () = &mut expiry => break None,
                _ = ticker.tick() => {}
            }

            let probe = tokio::select! {
                biased;
                () = &mut expiry => break None,
                result = api.find_machine_by_name(app, machine_name) => result,
            };
            match probe {
                Ok(machine) if machine.state.is_known_good() => break Some(machine),
                Ok(machine) => {
                    debug!(
                        app,
                        machine = machine_name,
                        state = %machine.state,
                        "machine not ready"
                    );
                }
                Err(err) => {
                    debug!(app, machine = machine_name, error = %err, "machine lookup failed");
                }
            }
        };

        if let Some(machine) = outcome {
            state = ReadinessState::Ready;
            debug!(
                app,
                machine = machine_name,
                ?state,
                elapsed = ?started.elapsed(),
                "machine ready"
            );
            return Ok(machine);
        }
        state = ReadinessState::TimedOut;
        debug!(app, machine = machine_name, ?state, "readiness wait expired");
        Err(ProviderError::timeout(
            format!("machine {machine_name} to become ready"),
            started.elapsed(),
        ))
    }
}
