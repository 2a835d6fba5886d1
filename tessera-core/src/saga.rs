//! Saga execution with reverse-order compensation
//!
//! Used for multi-step writes that span stores without a shared transaction. Forward steps run
//! in order; when one fails, every step that already completed is compensated, newest first,
//! and the original error is handed back together with any compensation that failed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::ServiceError;
use crate::metrics::CoreMetrics;

/// One forward operation and the operation that undoes it.
#[async_trait]
pub trait CompensableStep: Send + Sync {
    fn name(&self) -> &str;

    /// Perform the step. The returned value is handed to `compensate` if a later step fails.
    async fn forward(&self) -> Result<Value, ServiceError>;

    async fn compensate(&self, output: &Value) -> Result<(), ServiceError>;
}

/// Step assembled from two closures.
pub struct FnStep<F, C> {
    name: String,
    forward: F,
    compensate: C,
}

impl<F, FFut, C, CFut> FnStep<F, C>
where
    F: Fn() -> FFut + Send + Sync,
    FFut: Future<Output = Result<Value, ServiceError>> + Send,
    C: Fn(Value) -> CFut + Send + Sync,
    CFut: Future<Output = Result<(), ServiceError>> + Send,
{
    pub fn new(name: impl Into<String>, forward: F, compensate: C) -> Self {
        Self {
            name: name.into(),
            forward,
            compensate,
        }
    }

    pub fn boxed(self) -> Box<dyn CompensableStep>
    where
        F: 'static,
        C: 'static,
    {
        Box::new(self)
    }
}

#[async_trait]
impl<F, FFut, C, CFut> CompensableStep for FnStep<F, C>
where
    F: Fn() -> FFut + Send + Sync,
    FFut: Future<Output = Result<Value, ServiceError>> + Send,
    C: Fn(Value) -> CFut + Send + Sync,
    CFut: Future<Output = Result<(), ServiceError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&self) -> Result<Value, ServiceError> {
        (self.forward)().await
    }

    async fn compensate(&self, output: &Value) -> Result<(), ServiceError> {
        (self.compensate)(output.clone()).await
    }
}

/// Outputs of a saga whose steps all completed, in step order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SagaOutcome {
    pub saga_id: String,
    pub outputs: Vec<(String, Value)>,
}

impl SagaOutcome {
    pub fn output(&self, step: &str) -> Option<&Value> {
        self.outputs
            .iter()
            .find(|(name, _)| name == step)
            .map(|(_, value)| value)
    }
}

/// A compensation that itself failed and needs manual reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub output: Value,
    pub reason: String,
}

impl CompensationFailure {
    pub fn to_error(&self) -> ServiceError {
        ServiceError::CompensationFailed {
            step: self.step.clone(),
            reason: self.reason.clone(),
        }
    }
}

/// Failure of a saga: the step that failed, its original error, and the unwind report.
#[derive(Debug)]
pub struct SagaError {
    pub saga_id: String,
    pub failed_step: String,
    pub cause: ServiceError,
    /// Steps compensated successfully, in the order they were compensated.
    pub compensated: Vec<String>,
    pub compensation_failures: Vec<CompensationFailure>,
}

impl SagaError {
    /// The error that triggered the unwind.
    pub fn cause(&self) -> &ServiceError {
        &self.cause
    }

    pub fn into_cause(self) -> ServiceError {
        self.cause
    }

    /// True if every completed step was undone.
    pub fn fully_compensated(&self) -> bool {
        self.compensation_failures.is_empty()
    }
}

impl fmt::Display for SagaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "saga step '{}' failed: {}", self.failed_step, self.cause)?;
        if !self.compensation_failures.is_empty() {
            write!(
                f,
                " ({} compensation(s) failed)",
                self.compensation_failures.len()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for SagaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

#[derive(Default)]
pub struct CompensationRunner {
    metrics: Option<Arc<CoreMetrics>>,
}

impl CompensationRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(mut self, metrics: Arc<CoreMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run `steps` in order; on the first failure compensate the completed ones in reverse.
    #[instrument(skip_all, fields(steps = steps.len()))]
    pub async fn run(
        &self,
        steps: Vec<Box<dyn CompensableStep>>,
    ) -> Result<SagaOutcome, SagaError> {
        let saga_id = Uuid::new_v4().to_string();
        let mut completed: Vec<(usize, Value)> = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            match step.forward().await {
                Ok(output) => {
                    info!(saga_id = %saga_id, step = step.name(), "Saga step completed");
                    completed.push((index, output));
                }
                Err(cause) => {
                    warn!(
                        saga_id = %saga_id,
                        step = step.name(),
                        "Saga step failed, compensating {} completed step(s): {}",
                        completed.len(),
                        cause
                    );
                    let (compensated, compensation_failures) =
                        self.unwind(&saga_id, &steps, completed).await;
                    return Err(SagaError {
                        saga_id,
                        failed_step: step.name().to_string(),
                        cause,
                        compensated,
                        compensation_failures,
                    });
                }
            }
        }

        let outputs = completed
            .into_iter()
            .map(|(index, output)| (steps[index].name().to_string(), output))
            .collect();
        Ok(SagaOutcome { saga_id, outputs })
    }

    async fn unwind(
        &self,
        saga_id: &str,
        steps: &[Box<dyn CompensableStep>],
        completed: Vec<(usize, Value)>,
    ) -> (Vec<String>, Vec<CompensationFailure>) {
        let mut compensated = Vec::new();
        let mut failures = Vec::new();

        for (index, output) in completed.into_iter().rev() {
            let step = &steps[index];
            match step.compensate(&output).await {
                Ok(()) => {
                    info!(saga_id = %saga_id, step = step.name(), "Compensated saga step");
                    compensated.push(step.name().to_string());
                    self.record("succeeded");
                }
                Err(e) => {
                    error!(
                        saga_id = %saga_id,
                        step = step.name(),
                        output = %output,
                        "Compensation failed, manual reconciliation required: {}",
                        e
                    );
                    failures.push(CompensationFailure {
                        step: step.name().to_string(),
                        output,
                        reason: e.to_string(),
                    });
                    self.record("failed");
                }
            }
        }

        (compensated, failures)
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.saga_compensations.with_label_values(&[outcome]).inc();
        }
    }
}
