//! Runs a validated plan: one step at a time, in plan order.

use std::collections::HashSet;

use graphrecon_core::{
    CancelToken, Clock, ErrorInfo, HttpProbe, Lookup, OperationOutcome, Probe, PropagationCheck,
    PropagationState, PropagationWaiter, Reconciler, Request, RestResourceApi, Transport,
    VisibleProbe,
};
use tracing::{info, warn};

use crate::config::{Plan, ProbeConfig, PropagationSpec, Step, expand_uri};
use crate::report::StepReport;

/// The probe a step asked for, bound to the live API.
pub enum StepProbe<'a, T> {
    Visible(VisibleProbe<'a, RestResourceApi<T>>),
    Http(HttpProbe<&'a T>),
}

impl<T: Transport> Probe for StepProbe<'_, T> {
    fn poll(&mut self) -> Result<bool, ErrorInfo> {
        match self {
            StepProbe::Visible(p) => p.poll(),
            StepProbe::Http(p) => p.poll(),
        }
    }
}

pub struct Orchestrator<'a, T, C> {
    reconciler: &'a Reconciler<RestResourceApi<T>, C>,
    cancel: &'a CancelToken,
}

impl<'a, T: Transport, C: Clock> Orchestrator<'a, T, C> {
    pub fn new(reconciler: &'a Reconciler<RestResourceApi<T>, C>, cancel: &'a CancelToken) -> Self {
        Self { reconciler, cancel }
    }

    /// Reconcile every step. A step runs only when all of its dependencies
    /// succeeded and finished propagating.
    pub fn apply(&self, plan: &Plan) -> Vec<StepReport> {
        let mut settled: HashSet<&str> = HashSet::new();
        let mut reports = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            if self.cancel.is_cancelled() {
                reports.push(StepReport::skipped(step, "cancelled"));
                continue;
            }
            if let Some(dep) = step.depends_on.iter().find(|d| !settled.contains(d.as_str())) {
                warn!(step = %step.id, dependency = %dep, "Skipping step");
                reports.push(StepReport::skipped(
                    step,
                    format!("dependency '{}' not settled", dep),
                ));
                continue;
            }

            info!(step = %step.id, "Applying");
            let outcome = self.reconciler.reconcile_with(&step.descriptor, step.update);
            let outcome = match &step.propagation {
                Some(spec) if outcome.changed() => self.wait(step, spec, outcome),
                _ => outcome,
            };

            let propagated = !matches!(
                outcome.propagation(),
                Some(PropagationState::Pending | PropagationState::TimedOut)
            );
            if outcome.is_success() && propagated {
                settled.insert(step.id.as_str());
            }
            reports.push(StepReport::from_outcome(step, &outcome));
        }

        reports
    }

    /// Look up every step without changing anything.
    pub fn check(&self, plan: &Plan) -> Vec<StepReport> {
        plan.steps
            .iter()
            .map(|step| match self.reconciler.lookup(&step.descriptor) {
                Ok(lookup) => StepReport::from_lookup(step, &lookup),
                Err(e) => StepReport::failed(step, &e),
            })
            .collect()
    }

    /// Re-poll one step's propagation probe against the existing resource.
    pub fn wait_step(&self, step: &Step) -> StepReport {
        let Some(spec) = &step.propagation else {
            return StepReport::skipped(step, "step has no propagation check");
        };
        let existing = match self.reconciler.lookup(&step.descriptor) {
            Ok(Lookup::Present(existing)) => existing,
            Ok(other) => return StepReport::from_lookup(step, &other),
            Err(e) => return StepReport::failed(step, &e),
        };

        let mut check = match self.check_for(step, spec, Some(&existing.id)) {
            Ok(check) => check,
            Err(e) => return StepReport::failed(step, &e),
        };
        let waiter = PropagationWaiter::with_clock(self.reconciler.clock());
        let state = waiter
            .wait(&step.id, &mut check, self.cancel)
            .unwrap_or(PropagationState::Pending);
        StepReport::from_wait(step, &existing.id, state)
    }

    fn wait(&self, step: &Step, spec: &PropagationSpec, outcome: OperationOutcome) -> OperationOutcome {
        let mut check = match self.check_for(step, spec, outcome.resource_id()) {
            Ok(check) => check,
            Err(e) => {
                warn!(step = %step.id, error = %e, "Cannot build propagation probe");
                return outcome.with_propagation(PropagationState::Pending);
            }
        };

        let waiter = PropagationWaiter::with_clock(self.reconciler.clock());
        match waiter.wait(&step.id, &mut check, self.cancel) {
            Ok(state) => outcome.with_propagation(state),
            Err(cancelled) => {
                warn!(step = %step.id, "{}", cancelled);
                outcome.with_propagation(PropagationState::Pending)
            }
        }
    }

    fn check_for(
        &self,
        step: &Step,
        spec: &PropagationSpec,
        id: Option<&str>,
    ) -> Result<PropagationCheck<StepProbe<'a, T>>, ErrorInfo> {
        let api = self.reconciler.api();
        let descriptor = &step.descriptor;

        let probe = match &spec.probe {
            ProbeConfig::Visible => StepProbe::Visible(VisibleProbe::new(
                api,
                descriptor.kind(),
                descriptor.natural_key(),
            )),
            ProbeConfig::Http {
                uri,
                pointer,
                equals,
            } => {
                let uri = expand_uri(uri, id.unwrap_or_default(), descriptor.natural_key());
                // Each probe call ends within one poll interval.
                let request = Request::get(&uri)
                    .map_err(|e| ErrorInfo::permanent(e.to_string()))?
                    .with_timeout(spec.poll_interval);
                let probe = HttpProbe::new(api.transport(), request);
                match (pointer, equals) {
                    (Some(pointer), Some(value)) => {
                        StepProbe::Http(probe.expect(pointer.as_str(), value.clone()))
                    }
                    _ => StepProbe::Http(probe),
                }
            }
        };

        PropagationCheck::new(probe, spec.poll_interval, spec.max_wait)
            .map_err(|e| ErrorInfo::permanent(e.to_string()))
    }
}
