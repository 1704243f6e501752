use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::conformance::Scenario;
use crate::core::queue::QueueError;
use crate::provision::{ProvisionError, TeardownError};

/// Why a scenario failed.
///
/// A contract violation means the queue misbehaved. A timeout means the harness gave up waiting,
/// which may just as well mean the pool never started.
#[derive(Error, Debug)]
pub enum ScenarioFailure {
    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("timed out after {waited:?}: {detail}")]
    Timeout { waited: Duration, detail: String },

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl ScenarioFailure {
    pub fn violation(detail: impl Into<String>) -> Self {
        Self::ContractViolation(detail.into())
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Self::ContractViolation(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug)]
pub enum Outcome {
    Passed,
    Failed(ScenarioFailure),
    Skipped(String),
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

/// Result of one scenario at one pool size.
#[derive(Debug)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub pool_size: usize,
    pub outcome: Outcome,
    /// Teardown failures are reported even when the scenario itself passed.
    pub teardown: Vec<TeardownError>,
    pub elapsed: Duration,
}

impl ScenarioReport {
    pub(crate) fn skipped(scenario: Scenario, pool_size: usize, reason: impl Into<String>) -> Self {
        Self {
            scenario,
            pool_size,
            outcome: Outcome::Skipped(reason.into()),
            teardown: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.outcome.is_failed() && self.teardown.is_empty()
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (pool {}): ", self.scenario, self.pool_size)?;
        match &self.outcome {
            Outcome::Passed => write!(f, "passed in {:?}", self.elapsed)?,
            Outcome::Failed(failure) => write!(f, "FAILED: {}", failure)?,
            Outcome::Skipped(reason) => write!(f, "skipped ({})", reason)?,
        }
        for error in &self.teardown {
            write!(f, "\n    teardown: {}", error)?;
        }
        Ok(())
    }
}

/// Every scenario run for one [`TestCase`](crate::conformance::TestCase).
#[derive(Debug)]
pub struct CaseReport {
    pub case: String,
    pub skipped: bool,
    /// Set when a queue could not be built. Scenarios after that are skipped.
    pub provision_error: Option<ProvisionError>,
    pub scenarios: Vec<ScenarioReport>,
}

impl CaseReport {
    pub(crate) fn new(case: impl Into<String>) -> Self {
        Self {
            case: case.into(),
            skipped: false,
            provision_error: None,
            scenarios: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.provision_error.is_none() && self.scenarios.iter().all(ScenarioReport::is_success)
    }

    pub fn passed(&self) -> usize {
        self.scenarios
            .iter()
            .filter(|report| matches!(report.outcome, Outcome::Passed))
            .count()
    }

    /// Panic with the full report unless every scenario passed and tore down cleanly.
    #[track_caller]
    pub fn assert_passed(&self) {
        if !self.is_success() {
            panic!("{}", self);
        }
    }
}

impl fmt::Display for CaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.skipped {
            return write!(f, "case '{}': skipped", self.case);
        }
        write!(
            f,
            "case '{}': {} of {} scenario runs passed",
            self.case,
            self.passed(),
            self.scenarios.len()
        )?;
        if let Some(error) = &self.provision_error {
            write!(f, "\n  provisioning failed: {}", error)?;
        }
        for report in &self.scenarios {
            write!(f, "\n  {}", report)?;
        }
        Ok(())
    }
}

/// Reports for a whole matrix, one per case.
#[derive(Debug, Default)]
pub struct MatrixReport {
    pub cases: Vec<CaseReport>,
}

impl MatrixReport {
    pub fn is_success(&self) -> bool {
        self.cases.iter().all(CaseReport::is_success)
    }

    pub fn case(&self, name: &str) -> Option<&CaseReport> {
        self.cases.iter().find(|report| report.case == name)
    }

    #[track_caller]
    pub fn assert_passed(&self) {
        if !self.is_success() {
            panic!("{}", self);
        }
    }
}

impl fmt::Display for MatrixReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed = self.cases.iter().filter(|c| !c.is_success()).count();
        write!(f, "{} case(s), {} failed", self.cases.len(), failed)?;
        for case in &self.cases {
            write!(f, "\n{}", case)?;
        }
        Ok(())
    }
}
