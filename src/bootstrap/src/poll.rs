// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Waiting for nodes to report a healthy k3s service.

use std::future::Future;
use std::time::Duration;

use ha_orchestrator::{CommandExecutor, RemoteHost};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The default time between two probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// The default bound on the whole wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The status the probe command prints once the service is up.
pub const READY_STATUS: &str = "active";

/// The cadence and deadline of a repeated remote check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// The time between two attempts.
    pub interval: Duration,
    /// The bound on the time spent attempting.
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// A wait that ended without the node reporting ready.
#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error(
        "{host} did not report \"active\" within {timeout:?} after {probes} probes{}",
        display_last(.last_failure)
    )]
    Timeout {
        host: String,
        timeout: Duration,
        probes: u32,
        last_failure: Option<String>,
    },
    #[error("cancelled while waiting for {host} to become ready")]
    Cancelled { host: String },
}

fn display_last(last_failure: &Option<String>) -> String {
    match last_failure {
        Some(failure) => format!(" (last probe: {failure})"),
        None => String::new(),
    }
}

/// Probes `host` with `probe` until it prints [`READY_STATUS`].
///
/// The first probe runs one interval after the call. A failed probe counts
/// as "not ready yet"; only the deadline ends the wait unsuccessfully. The
/// wait between probes is abandoned as soon as the deadline passes or
/// `cancel` fires, but a probe already in flight is allowed to finish.
///
/// Returns the number of probes it took.
pub async fn wait_until_ready(
    executor: &dyn CommandExecutor,
    host: &RemoteHost,
    probe: &str,
    config: PollConfig,
    cancel: &CancellationToken,
) -> Result<u32, ReadinessError> {
    let result = poll(config, FirstAttempt::AfterInterval, cancel, move |attempt| async move {
        match executor.execute(probe, host).await {
            Ok(status) if status.trim() == READY_STATUS => Ok(()),
            Ok(status) => {
                debug!("{host} reports {status:?} on probe {attempt}");
                Err(format!("status {:?}", status.trim()))
            }
            Err(e) => {
                warn!("probe {attempt} of {host} failed: {e}");
                Err(e.to_string())
            }
        }
    })
    .await;

    match result {
        Ok(((), probes)) => {
            info!("{host} is ready after {probes} probes");
            Ok(probes)
        }
        Err(Stopped {
            reason: StopReason::Deadline,
            attempts,
            last_failure,
        }) => Err(ReadinessError::Timeout {
            host: host.to_string(),
            timeout: config.timeout,
            probes: attempts,
            last_failure,
        }),
        Err(Stopped {
            reason: StopReason::Cancelled,
            ..
        }) => Err(ReadinessError::Cancelled {
            host: host.to_string(),
        }),
        // Every probe failure is retried.
        Err(Stopped {
            reason: StopReason::GaveUp,
            attempts,
            last_failure,
        }) => Err(ReadinessError::Timeout {
            host: host.to_string(),
            timeout: config.timeout,
            probes: attempts,
            last_failure,
        }),
    }
}

/// When the first attempt of a [`poll`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FirstAttempt {
    Immediately,
    AfterInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Deadline,
    Cancelled,
    /// An attempt failed in a way that retrying cannot fix.
    GaveUp,
}

/// Why a single attempt of a [`poll`] failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttemptError {
    /// The next tick may succeed.
    Retry(String),
    /// Ends the poll at once.
    Fatal(String),
}

impl From<String> for AttemptError {
    fn from(failure: String) -> Self {
        AttemptError::Retry(failure)
    }
}

impl From<&str> for AttemptError {
    fn from(failure: &str) -> Self {
        AttemptError::Retry(failure.into())
    }
}

/// Why a [`poll`] gave up, and what it last saw.
#[derive(Debug)]
pub(crate) struct Stopped {
    pub reason: StopReason,
    pub attempts: u32,
    pub last_failure: Option<String>,
}

/// Runs `attempt` on the cadence of `config` until it succeeds.
///
/// `attempt` receives the 1-based attempt number and reports why it failed.
/// An attempt due at or before the deadline runs, including one due exactly
/// at it, so a `timeout` that is a multiple of the interval allows
/// `timeout / interval` attempts after the first interval. Cancellation wins
/// over a due attempt, and none starts once an earlier attempt has overrun
/// the deadline.
pub(crate) async fn poll<T, E, F, Fut>(
    config: PollConfig,
    first: FirstAttempt,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<(T, u32), Stopped>
where
    E: Into<AttemptError>,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    // `interval_at` panics on a zero period.
    let period = config.interval.max(Duration::from_millis(1));
    let start = Instant::now();
    let deadline = start + config.timeout;
    let first_tick = match first {
        FirstAttempt::Immediately => start,
        FirstAttempt::AfterInterval => start + period,
    };
    let mut ticker = time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempts = 0;
    let mut last_failure = None;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Stopped { reason: StopReason::Cancelled, attempts, last_failure });
            }
            _ = ticker.tick() => {
                attempts += 1;
                match attempt(attempts).await.map_err(Into::into) {
                    Ok(value) => return Ok((value, attempts)),
                    Err(AttemptError::Retry(failure)) => last_failure = Some(failure),
                    Err(AttemptError::Fatal(failure)) => {
                        return Err(Stopped {
                            reason: StopReason::GaveUp,
                            attempts,
                            last_failure: Some(failure),
                        });
                    }
                }
                if Instant::now() > deadline {
                    return Err(Stopped { reason: StopReason::Deadline, attempts, last_failure });
                }
            }
            _ = time::sleep_until(deadline) => {
                return Err(Stopped { reason: StopReason::Deadline, attempts, last_failure });
            }
        }
    }
}
