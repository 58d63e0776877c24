//! Reconnection probe.
//!
//! Runs the full scan/connect/exchange/disconnect cycle several times in a
//! row. Each attempt has to find the peripheral advertising again, so a
//! firmware that forgets to restart advertising after a disconnect fails on
//! attempt 2.

use std::fmt;

use tracing::{debug, info, warn};

use crate::ble::transport::BleTransport;
use crate::client::EchoClient;
use crate::error::{Error, Result};
use crate::events::EchoEvent;
use crate::exchange::ExchangeReport;

/// Where the probe is; attempt numbers are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeState {
    /// Scanning for the peripheral.
    Attempting(u32),
    /// Link is open.
    Connected(u32),
    /// Exchange and disconnect completed.
    Verified(u32),
    /// Every attempt was verified.
    Succeeded,
    /// The given attempt failed; no further attempts were made.
    Failed(u32),
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempting(i) => write!(f, "Attempting({})", i),
            Self::Connected(i) => write!(f, "Connected({})", i),
            Self::Verified(i) => write!(f, "Verified({})", i),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed(i) => write!(f, "Failed({})", i),
        }
    }
}

/// How the probe ended.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// Every attempt completed.
    AllSucceeded {
        /// Number of attempts made.
        attempts: u32,
    },
    /// An attempt failed and the probe stopped.
    Failed {
        /// The failing attempt.
        attempt: u32,
        /// Why it failed.
        error: Error,
    },
}

/// Full record of a probe run.
#[derive(Debug)]
pub struct ProbeReport {
    /// Every state the probe passed through, in order.
    pub states: Vec<ProbeState>,
    /// Reports of the attempts that completed.
    pub exchanges: Vec<ExchangeReport>,
    /// Final result.
    pub outcome: ProbeOutcome,
}

impl ProbeReport {
    /// Check if every attempt succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::AllSucceeded { .. })
    }

    /// The attempt that failed, if any.
    pub fn failed_attempt(&self) -> Option<u32> {
        match self.outcome {
            ProbeOutcome::Failed { attempt, .. } => Some(attempt),
            ProbeOutcome::AllSucceeded { .. } => None,
        }
    }

    /// Convert into a `Result`, keeping the failing attempt in the error.
    pub fn into_result(self) -> Result<u32> {
        match self.outcome {
            ProbeOutcome::AllSucceeded { attempts } => Ok(attempts),
            ProbeOutcome::Failed { attempt, error } => Err(Error::ProbeFailed {
                attempt,
                source: Box::new(error),
            }),
        }
    }
}

/// Drives the repeated cycle on behalf of an [`EchoClient`].
pub struct ReconnectionProbe<'a, T: BleTransport> {
    client: &'a EchoClient<T>,
    states: Vec<ProbeState>,
}

impl<'a, T: BleTransport> ReconnectionProbe<'a, T> {
    /// Create a probe using the client's configuration.
    pub fn new(client: &'a EchoClient<T>) -> Self {
        Self {
            client,
            states: Vec::new(),
        }
    }

    /// Run every attempt, stopping at the first failure.
    pub async fn run(mut self) -> ProbeReport {
        let client = self.client;
        let config = client.config();
        let total = config.reconnect_attempts;
        let mut exchanges = Vec::new();

        info!("Starting reconnection probe with {} attempts", total);

        for attempt in 1..=total {
            self.transition(ProbeState::Attempting(attempt));
            client.emit(EchoEvent::AttemptStarted { attempt, total });

            match self.attempt(attempt).await {
                Ok(report) => {
                    self.transition(ProbeState::Verified(attempt));
                    client.emit(EchoEvent::AttemptSucceeded(attempt));
                    exchanges.push(report);
                }
                Err(error) => {
                    warn!("Attempt {} failed: {}", attempt, error);
                    self.transition(ProbeState::Failed(attempt));
                    client.emit(EchoEvent::AttemptFailed {
                        attempt,
                        reason: error.to_string(),
                        unreachable: error.is_unreachable(),
                    });
                    return ProbeReport {
                        states: self.states,
                        exchanges,
                        outcome: ProbeOutcome::Failed { attempt, error },
                    };
                }
            }

            if attempt < total {
                client.emit(EchoEvent::WaitingForNextAttempt(config.reconnect_delay));
                tokio::time::sleep(config.reconnect_delay).await;
            }
        }

        self.transition(ProbeState::Succeeded);
        client.emit(EchoEvent::ProbeSucceeded(total));

        ProbeReport {
            states: self.states,
            exchanges,
            outcome: ProbeOutcome::AllSucceeded { attempts: total },
        }
    }

    async fn attempt(&mut self, attempt: u32) -> Result<ExchangeReport> {
        let client = self.client;
        let config = client.config();

        let peripheral = client
            .find_target()
            .await?
            .ok_or_else(|| Error::DeviceNotFound {
                target: config.target_description(),
                timeout: config.scan_timeout,
            })?;

        let link = client.connect(&peripheral).await?;

        let message = format!("{}_{}", config.message, attempt);
        let states = &mut self.states;
        client
            .sequencer()
            .run_observed(&link, &peripheral, &message, || {
                record(states, ProbeState::Connected(attempt))
            })
            .await
    }

    fn transition(&mut self, state: ProbeState) {
        record(&mut self.states, state);
    }
}

fn record(states: &mut Vec<ProbeState>, state: ProbeState) {
    debug!(
        "Probe state: {} -> {}",
        states
            .last()
            .map(ToString::to_string)
            .unwrap_or_else(|| "Idle".to_string()),
        state
    );
    states.push(state);
}
