//! Enforcement Executor
//!
//! Applies every enabled strategy to an unauthorized device, in order.
//! Strategies are independent: one failing never stops the next, and the
//! executor never returns an error. The aggregated [`EnforcementReport`]
//! says what happened per strategy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dg_error::DevGuardError;

use crate::device::ObservedDevice;
use crate::events::{EventSink, GuardEvent};
use crate::platform::bounded::BoundedCall;
use crate::platform::EnforcementStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Hide the volume from the user's file manager
    HideVolume,
    /// Eject the medium behind the volume
    EjectMedia,
    /// Disable the device node in the OS device manager
    DisableDeviceNode,
}

impl StrategyKind {
    /// Default application order
    pub const ALL: [StrategyKind; 3] = [Self::HideVolume, Self::EjectMedia, Self::DisableDeviceNode];

    pub fn needs_volume(self) -> bool {
        matches!(self, Self::HideVolume | Self::EjectMedia)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::HideVolume => "hide_volume",
            Self::EjectMedia => "eject_media",
            Self::DisableDeviceNode => "disable_device_node",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = DevGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DevGuardError::InvalidConfig {
                field: "strategies".into(),
                reason: format!("unknown strategy '{s}'"),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StrategyOutcome {
    Applied,
    Failed(String),
    /// Not applicable to this device (volume strategy on a peripheral)
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyResult {
    pub strategy: StrategyKind,
    pub outcome: StrategyOutcome,
}

/// Per-strategy results for one device, in application order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementReport {
    pub results: Vec<StrategyResult>,
}

impl EnforcementReport {
    pub fn any_applied(&self) -> bool {
        self.results.iter().any(|r| r.outcome == StrategyOutcome::Applied)
    }

    pub fn all_failed(&self) -> bool {
        let attempted: Vec<_> = self
            .results
            .iter()
            .filter(|r| r.outcome != StrategyOutcome::Skipped)
            .collect();
        !attempted.is_empty()
            && attempted
                .iter()
                .all(|r| matches!(r.outcome, StrategyOutcome::Failed(_)))
    }

    pub fn outcome_of(&self, kind: StrategyKind) -> Option<&StrategyOutcome> {
        self.results
            .iter()
            .find(|r| r.strategy == kind)
            .map(|r| &r.outcome)
    }
}

pub struct Enforcer {
    /// Each strategy with its own call site
    strategies: Vec<(Arc<dyn EnforcementStrategy>, BoundedCall)>,
    timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl Enforcer {
    pub fn new(
        strategies: Vec<Arc<dyn EnforcementStrategy>>,
        timeout: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let strategies = strategies
            .into_iter()
            .map(|strategy| {
                let call = BoundedCall::new(strategy.kind().as_str());
                (strategy, call)
            })
            .collect();
        Self {
            strategies,
            timeout,
            events,
        }
    }

    pub fn strategy_kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|(s, _)| s.kind()).collect()
    }

    /// Best effort. Each strategy runs under the enforcement timeout.
    pub fn enforce(&self, device: &ObservedDevice) -> EnforcementReport {
        let mut results = Vec::with_capacity(self.strategies.len());

        for (strategy, call) in &self.strategies {
            let kind = strategy.kind();
            if !strategy.applies_to(device) {
                results.push(StrategyResult {
                    strategy: kind,
                    outcome: StrategyOutcome::Skipped,
                });
                continue;
            }

            let worker_strategy = Arc::clone(strategy);
            let worker_device = device.clone();
            let outcome = match call.call(self.timeout, move || worker_strategy.apply(&worker_device)) {
                Ok(()) => {
                    self.events.emit(&GuardEvent::StrategyApplied {
                        identity: device.identity.clone(),
                        strategy: kind,
                    });
                    StrategyOutcome::Applied
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.events.emit(&GuardEvent::StrategyFailed {
                        identity: device.identity.clone(),
                        strategy: kind,
                        reason: reason.clone(),
                    });
                    StrategyOutcome::Failed(reason)
                }
            };

            results.push(StrategyResult {
                strategy: kind,
                outcome,
            });
        }

        EnforcementReport { results }
    }
}
