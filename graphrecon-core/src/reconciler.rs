//! Idempotent reconciler: make a named resource exist exactly once.
//!
//! 1. Look the resource up by natural key.
//! 2. One match: nothing to do (or patch the difference when opted in).
//! 3. No match: create it.
//! 4. Several matches: fail. Duplicate names are the caller's problem to
//!    fix, never something to pick a winner for.

use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::api::{RemoteResource, ResourceApi};
use crate::clock::{Clock, SystemClock};
use crate::descriptor::ResourceDescriptor;
use crate::error::{Cancelled, ErrorInfo};
use crate::outcome::OperationOutcome;
use crate::propagation::{CancelToken, Probe, PropagationCheck, PropagationWaiter};
use crate::retry::{RetryExecutor, RetryPolicy};

/// What to do when the resource already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Leave it untouched.
    #[default]
    Skip,
    /// PATCH the top-level properties that differ from the desired ones.
    Patch,
}

/// Result of a natural-key lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Absent,
    Present(RemoteResource),
    Ambiguous(Vec<RemoteResource>),
}

impl From<Vec<RemoteResource>> for Lookup {
    fn from(mut found: Vec<RemoteResource>) -> Self {
        match found.len() {
            0 => Self::Absent,
            1 => match found.pop() {
                Some(r) => Self::Present(r),
                None => Self::Absent,
            },
            _ => Self::Ambiguous(found),
        }
    }
}

fn ambiguous(what: &str, matches: &[RemoteResource]) -> ErrorInfo {
    let ids: Vec<&str> = matches.iter().map(|r| r.id.as_str()).collect();
    ErrorInfo::ambiguous(format!(
        "{} resources match {}: {}",
        matches.len(),
        what,
        ids.join(", ")
    ))
}

/// Top-level desired properties whose actual value differs.
pub fn property_diff(desired: &Map<String, Value>, actual: &Map<String, Value>) -> Map<String, Value> {
    desired
        .iter()
        .filter(|(k, v)| actual.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub struct Reconciler<A, C = SystemClock> {
    api: A,
    retry: RetryExecutor<C>,
    update_mode: UpdateMode,
}

impl<A: ResourceApi> Reconciler<A, SystemClock> {
    pub fn new(api: A, policy: RetryPolicy) -> Self {
        Self::with_executor(api, RetryExecutor::new(policy))
    }
}

impl<A: ResourceApi, C: Clock> Reconciler<A, C> {
    pub fn with_executor(api: A, retry: RetryExecutor<C>) -> Self {
        Self {
            api,
            retry,
            update_mode: UpdateMode::Skip,
        }
    }

    pub fn with_update_mode(mut self, mode: UpdateMode) -> Self {
        self.update_mode = mode;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn clock(&self) -> &C {
        self.retry.clock()
    }

    /// Look up the resource without changing anything.
    pub fn lookup(&self, descriptor: &ResourceDescriptor) -> Result<Lookup, ErrorInfo> {
        let what = describe(descriptor);
        self.retry
            .run(&format!("find {}", what), |_| {
                self.api
                    .find_by_key(descriptor.kind(), descriptor.natural_key())
            })
            .result
            .map(Lookup::from)
    }

    /// Reconcile with the reconciler's default update mode.
    pub fn reconcile(&self, descriptor: &ResourceDescriptor) -> OperationOutcome {
        self.reconcile_with(descriptor, self.update_mode)
    }

    pub fn reconcile_with(&self, descriptor: &ResourceDescriptor, mode: UpdateMode) -> OperationOutcome {
        let what = describe(descriptor);

        let lookup = self.retry.run(&format!("find {}", what), |_| {
            self.api
                .find_by_key(descriptor.kind(), descriptor.natural_key())
        });
        let found = match lookup.result {
            Ok(found) => found,
            Err(e) => {
                error!(resource = %what, error = %e, "Lookup failed");
                return OperationOutcome::failed(e).with_attempts(lookup.attempts);
            }
        };

        let outcome = match Lookup::from(found) {
            Lookup::Ambiguous(matches) => {
                let e = ambiguous(&what, &matches);
                error!(resource = %what, error = %e, "Refusing to pick between duplicates");
                OperationOutcome::failed(e).with_attempts(lookup.attempts)
            }
            Lookup::Present(existing) => match mode {
                UpdateMode::Skip => {
                    OperationOutcome::already_exists(existing.id).with_attempts(lookup.attempts)
                }
                UpdateMode::Patch => self.patch(descriptor, &what, existing, lookup.attempts),
            },
            Lookup::Absent => self.create(descriptor, &what),
        };

        match outcome.resource_id() {
            Some(id) => info!(resource = %what, id, status = %outcome.status(), "Reconciled"),
            None => info!(resource = %what, status = %outcome.status(), "Reconciled"),
        }
        outcome
    }

    /// Reconcile, then wait for propagation if the resource changed and
    /// `check_for` yields a check for it.
    pub fn reconcile_and_wait<P, F>(
        &self,
        descriptor: &ResourceDescriptor,
        check_for: F,
        cancel: &CancelToken,
    ) -> Result<OperationOutcome, Cancelled>
    where
        P: Probe,
        F: FnOnce(&OperationOutcome) -> Option<PropagationCheck<P>>,
    {
        let outcome = self.reconcile(descriptor);
        if !outcome.changed() {
            return Ok(outcome);
        }
        let Some(mut check) = check_for(&outcome) else {
            return Ok(outcome);
        };

        let state = PropagationWaiter::with_clock(self.retry.clock()).wait(
            &describe(descriptor),
            &mut check,
            cancel,
        )?;
        Ok(outcome.with_propagation(state))
    }

    fn create(&self, descriptor: &ResourceDescriptor, what: &str) -> OperationOutcome {
        let kind = descriptor.kind();
        let key = descriptor.natural_key();
        let idempotent = self.api.create_is_idempotent(kind);

        let created = self.retry.run(&format!("create {}", what), |attempt| {
            if attempt > 1 && !idempotent {
                // A timed-out POST may still have landed; look before posting again.
                match Lookup::from(self.api.find_by_key(kind, key)?) {
                    Lookup::Absent => {}
                    Lookup::Present(existing) => {
                        warn!(resource = %what, id = %existing.id, "Earlier create attempt succeeded");
                        return Ok(existing);
                    }
                    Lookup::Ambiguous(matches) => return Err(ambiguous(what, &matches)),
                }
            }
            self.api.create(descriptor)
        });

        match created.result {
            Ok(resource) => OperationOutcome::created(resource.id).with_attempts(created.attempts),
            Err(e) => {
                error!(resource = %what, error = %e, attempts = created.attempts, "Create failed");
                OperationOutcome::failed(e).with_attempts(created.attempts)
            }
        }
    }

    fn patch(
        &self,
        descriptor: &ResourceDescriptor,
        what: &str,
        existing: RemoteResource,
        lookup_attempts: u32,
    ) -> OperationOutcome {
        let changes = property_diff(descriptor.desired_properties(), &existing.properties);
        if changes.is_empty() {
            return OperationOutcome::already_exists(existing.id).with_attempts(lookup_attempts);
        }

        let fields: Vec<&str> = changes.keys().map(String::as_str).collect();
        info!(resource = %what, id = %existing.id, fields = ?fields, "Patching drifted properties");

        let updated = self.retry.run(&format!("update {}", what), |_| {
            self.api.update(descriptor, &existing.id, &changes)
        });
        match updated.result {
            Ok(()) => OperationOutcome::updated(existing.id).with_attempts(updated.attempts),
            Err(e) => {
                error!(resource = %what, error = %e, "Update failed");
                OperationOutcome::failed(e).with_attempts(updated.attempts)
            }
        }
    }
}

fn describe(descriptor: &ResourceDescriptor) -> String {
    format!("{} '{}'", descriptor.kind(), descriptor.natural_key())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Classification;
    use crate::outcome::OutcomeStatus;
    use crate::propagation::PropagationState;
    use serde_json::json;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::time::Duration;

    /// In-memory directory with optional injected failures.
    #[derive(Default)]
    struct InMemoryApi {
        store: RefCell<Vec<(String, RemoteResource)>>,
        find_failures: RefCell<VecDeque<ErrorInfo>>,
        create_failures: RefCell<VecDeque<ErrorInfo>>,
        /// Store the resource even when the create call reports failure.
        lossy_create: bool,
        finds: RefCell<u32>,
        creates: RefCell<u32>,
        updates: RefCell<Vec<Map<String, Value>>>,
    }

    impl InMemoryApi {
        fn seed(&self, key: &str, id: &str) {
            let mut properties = Map::new();
            properties.insert("displayName".into(), json!(key));
            properties.insert("id".into(), json!(id));
            self.store.borrow_mut().push((
                key.to_string(),
                RemoteResource {
                    id: id.to_string(),
                    properties,
                },
            ));
        }
    }

    impl ResourceApi for InMemoryApi {
        fn find_by_key(&self, _kind: &str, natural_key: &str) -> Result<Vec<RemoteResource>, ErrorInfo> {
            *self.finds.borrow_mut() += 1;
            if let Some(e) = self.find_failures.borrow_mut().pop_front() {
                return Err(e);
            }
            Ok(self
                .store
                .borrow()
                .iter()
                .filter(|(k, _)| k == natural_key)
                .map(|(_, r)| r.clone())
                .collect())
        }

        fn create(&self, descriptor: &ResourceDescriptor) -> Result<RemoteResource, ErrorInfo> {
            *self.creates.borrow_mut() += 1;
            let id = format!("id-{}", self.creates.borrow());
            let failure = self.create_failures.borrow_mut().pop_front();
            if failure.is_none() || self.lossy_create {
                self.seed(descriptor.natural_key(), &id);
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(RemoteResource {
                    id,
                    properties: descriptor.desired_properties().clone(),
                }),
            }
        }

        fn update(
            &self,
            _descriptor: &ResourceDescriptor,
            _id: &str,
            changes: &Map<String, Value>,
        ) -> Result<(), ErrorInfo> {
            self.updates.borrow_mut().push(changes.clone());
            Ok(())
        }
    }

    fn reconciler<'a>(api: &'a InMemoryApi, clock: &'a ManualClock) -> Reconciler<&'a InMemoryApi, &'a ManualClock> {
        let policy = RetryPolicy::new(3, Duration::from_secs(2)).unwrap();
        Reconciler::with_executor(api, RetryExecutor::with_clock(policy, clock))
    }

    fn office() -> ResourceDescriptor {
        ResourceDescriptor::new("NamedLocation", "Office Locations").unwrap()
    }

    #[test]
    fn test_created_then_already_exists() {
        let api = InMemoryApi::default();
        let clock = ManualClock::new();
        let r = reconciler(&api, &clock);

        let first = r.reconcile(&office());
        assert_eq!(first.status(), OutcomeStatus::Created);
        let id = first.resource_id().unwrap().to_string();

        let second = r.reconcile(&office());
        assert_eq!(second.status(), OutcomeStatus::AlreadyExists);
        assert_eq!(second.resource_id(), Some(id.as_str()));

        assert_eq!(*api.creates.borrow(), 1);
        assert_eq!(api.store.borrow().len(), 1);
    }

    #[test]
    fn test_two_matches_is_ambiguous() {
        let api = InMemoryApi::default();
        api.seed("Office Locations", "a");
        api.seed("Office Locations", "b");
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock).reconcile(&office());
        assert_eq!(outcome.status(), OutcomeStatus::Failed);
        let err = outcome.error().unwrap();
        assert_eq!(err.classification, Classification::Ambiguous);
        assert!(err.message.contains("a, b"));
        assert_eq!(*api.creates.borrow(), 0);
    }

    #[test]
    fn test_lookup_failure_is_failed_outcome() {
        let api = InMemoryApi::default();
        api.find_failures
            .borrow_mut()
            .push_back(ErrorInfo::from_status(403, None, "Insufficient privileges"));
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock).reconcile(&office());
        assert_eq!(outcome.status(), OutcomeStatus::Failed);
        assert_eq!(outcome.error().unwrap().http_status, Some(403));
        assert_eq!(*api.finds.borrow(), 1);
        assert_eq!(*api.creates.borrow(), 0);
    }

    #[test]
    fn test_transient_lookup_retried() {
        let api = InMemoryApi::default();
        api.find_failures
            .borrow_mut()
            .push_back(ErrorInfo::from_status(429, None, "Too many requests"));
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock).reconcile(&office());
        assert_eq!(outcome.status(), OutcomeStatus::Created);
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_create_permanent_failure() {
        let api = InMemoryApi::default();
        api.create_failures
            .borrow_mut()
            .push_back(ErrorInfo::from_status(400, None, "Invalid ipRanges"));
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock).reconcile(&office());
        assert_eq!(outcome.status(), OutcomeStatus::Failed);
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(*api.creates.borrow(), 1);
    }

    #[test]
    fn test_lost_create_response_not_duplicated() {
        // First POST lands server-side but the client sees a gateway timeout.
        let api = InMemoryApi {
            lossy_create: true,
            ..Default::default()
        };
        api.create_failures
            .borrow_mut()
            .push_back(ErrorInfo::from_status(504, None, "Gateway timeout"));
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock).reconcile(&office());
        assert_eq!(outcome.status(), OutcomeStatus::Created);
        assert_eq!(outcome.resource_id(), Some("id-1"));
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(*api.creates.borrow(), 1);
        assert_eq!(api.store.borrow().len(), 1);
    }

    #[test]
    fn test_create_retried_after_transient_when_absent() {
        let api = InMemoryApi::default();
        api.create_failures
            .borrow_mut()
            .push_back(ErrorInfo::from_status(503, None, "unavailable"));
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock).reconcile(&office());
        assert_eq!(outcome.status(), OutcomeStatus::Created);
        assert_eq!(*api.creates.borrow(), 2);
        assert_eq!(api.store.borrow().len(), 1);
    }

    #[test]
    fn test_patch_mode_updates_drift_only() {
        let api = InMemoryApi::default();
        api.seed("Office Locations", "loc-1");
        let clock = ManualClock::new();
        let r = reconciler(&api, &clock).with_update_mode(UpdateMode::Patch);

        let desired = office()
            .with_property("displayName", json!("Office Locations"))
            .with_property("isTrusted", json!(true));
        let outcome = r.reconcile(&desired);
        assert_eq!(outcome.status(), OutcomeStatus::Updated);
        assert_eq!(outcome.resource_id(), Some("loc-1"));

        let updates = api.updates.borrow();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 1);
        assert_eq!(updates[0].get("isTrusted"), Some(&json!(true)));
    }

    #[test]
    fn test_patch_mode_no_drift_is_already_exists() {
        let api = InMemoryApi::default();
        api.seed("Office Locations", "loc-1");
        let clock = ManualClock::new();
        let r = reconciler(&api, &clock).with_update_mode(UpdateMode::Patch);

        api.find_failures
            .borrow_mut()
            .push_back(ErrorInfo::from_status(503, None, "Service Unavailable"));

        let outcome = r.reconcile(&office().with_property("displayName", json!("Office Locations")));
        assert_eq!(outcome.status(), OutcomeStatus::AlreadyExists);
        assert_eq!(outcome.attempts(), 2);
        assert!(api.updates.borrow().is_empty());
    }

    #[test]
    fn test_skip_mode_ignores_drift() {
        let api = InMemoryApi::default();
        api.seed("Office Locations", "loc-1");
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock).reconcile(&office().with_property("isTrusted", json!(true)));
        assert_eq!(outcome.status(), OutcomeStatus::AlreadyExists);
        assert!(api.updates.borrow().is_empty());
    }

    #[test]
    fn test_lookup_only() {
        let api = InMemoryApi::default();
        let clock = ManualClock::new();
        let r = reconciler(&api, &clock);
        assert_eq!(r.lookup(&office()).unwrap(), Lookup::Absent);
        api.seed("Office Locations", "x");
        assert!(matches!(r.lookup(&office()).unwrap(), Lookup::Present(res) if res.id == "x"));
        assert_eq!(*api.creates.borrow(), 0);
    }

    #[test]
    fn test_reconcile_and_wait_attaches_state() {
        let api = InMemoryApi::default();
        let clock = ManualClock::new();
        let r = reconciler(&api, &clock);
        let polls = Cell::new(0);

        let outcome = r
            .reconcile_and_wait(
                &office(),
                |o| {
                    assert!(o.resource_id().is_some());
                    PropagationCheck::new(
                        || -> Result<bool, ErrorInfo> {
                            polls.set(polls.get() + 1);
                            Ok(false)
                        },
                        Duration::from_secs(1),
                        Duration::from_secs(3),
                    )
                    .ok()
                },
                &CancelToken::new(),
            )
            .unwrap();

        assert_eq!(outcome.status(), OutcomeStatus::Created);
        assert_eq!(outcome.propagation(), Some(PropagationState::TimedOut));
        assert_eq!(polls.get(), 3);
    }

    #[test]
    fn test_no_wait_when_unchanged() {
        let api = InMemoryApi::default();
        api.seed("Office Locations", "x");
        let clock = ManualClock::new();

        let outcome = reconciler(&api, &clock)
            .reconcile_and_wait(
                &office(),
                |_| Some(PropagationCheck::schema(|| -> Result<bool, ErrorInfo> { Ok(true) })),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(outcome.status(), OutcomeStatus::AlreadyExists);
        assert_eq!(outcome.propagation(), None);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    mod rest {
        use super::*;
        use crate::api::tests::ScriptedTransport;
        use crate::api::{CreateStyle, KindRegistry, KindSpec, MAX_PAGES, RestResourceApi};
        use crate::transport::{Method, Request};

        const STORAGE: &str = "https://management.azure.com/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts";
        const GROUPS: &str = "https://graph.microsoft.com/v1.0/groups";

        fn kinds() -> KindRegistry {
            let mut kinds = KindRegistry::new();
            kinds.insert(
                "StorageAccount",
                KindSpec::new(STORAGE, "name", CreateStyle::Put)
                    .unwrap()
                    .with_api_version("2023-01-01"),
            );
            kinds.insert(
                "Group",
                KindSpec::new(GROUPS, "displayName", CreateStyle::Post).unwrap(),
            );
            kinds
        }

        fn rest<'c>(
            transport: ScriptedTransport,
            clock: &'c ManualClock,
        ) -> Reconciler<RestResourceApi<ScriptedTransport>, &'c ManualClock> {
            Reconciler::with_executor(
                RestResourceApi::new(transport, kinds()),
                RetryExecutor::with_clock(RetryPolicy::default(), clock),
            )
        }

        fn storage() -> ResourceDescriptor {
            ResourceDescriptor::new("StorageAccount", "labstorage01")
                .unwrap()
                .with_property("location", json!("westeurope"))
        }

        fn methods(r: &Reconciler<RestResourceApi<ScriptedTransport>, &ManualClock>) -> Vec<Method> {
            r.api().transport().sent().iter().map(Request::method).collect()
        }

        #[test]
        fn test_put_kind_created_with_body() {
            let clock = ManualClock::new();
            let transport = ScriptedTransport::default()
                .fail(ErrorInfo::from_status(404, Some("ResourceNotFound".into()), "not found"))
                .reply(200, json!({"id": "/subscriptions/sub/x/labstorage01", "name": "labstorage01"}));
            let r = rest(transport, &clock);

            let outcome = r.reconcile(&storage());
            assert_eq!(outcome.status(), OutcomeStatus::Created);
            assert_eq!(outcome.resource_id(), Some("/subscriptions/sub/x/labstorage01"));
            assert_eq!(methods(&r), vec![Method::Get, Method::Put]);
        }

        #[test]
        fn test_put_kind_accepted_without_body() {
            let clock = ManualClock::new();
            let transport = ScriptedTransport::default()
                .fail(ErrorInfo::from_status(404, Some("ResourceNotFound".into()), "not found"))
                .empty(202)
                .empty(202)
                .empty(202);
            let r = rest(transport, &clock);

            let outcome = r.reconcile(&storage());
            assert_eq!(outcome.status(), OutcomeStatus::Created);
            assert_eq!(outcome.attempts(), 1);
            assert_eq!(
                outcome.resource_id(),
                Some("/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts/labstorage01")
            );
            assert_eq!(methods(&r), vec![Method::Get, Method::Put]);
            assert_eq!(clock.elapsed(), Duration::ZERO);
        }

        #[test]
        fn test_put_kind_existing_is_left_alone() {
            let clock = ManualClock::new();
            let transport = ScriptedTransport::default()
                .reply(200, json!({"id": "/subscriptions/sub/x/labstorage01", "name": "labstorage01"}));
            let r = rest(transport, &clock);

            let outcome = r.reconcile(&storage());
            assert_eq!(outcome.status(), OutcomeStatus::AlreadyExists);
            assert_eq!(methods(&r), vec![Method::Get]);
        }

        #[test]
        fn test_truncated_listing_never_creates() {
            let clock = ManualClock::new();
            let mut transport = ScriptedTransport::default();
            for page in 0..MAX_PAGES {
                transport = transport.reply(
                    200,
                    json!({
                        "value": [{"id": format!("g-{}", page), "displayName": "Marketing"}],
                        "@odata.nextLink": format!("{}?$skiptoken={}", GROUPS, page)
                    }),
                );
            }
            let r = rest(transport, &clock);

            let outcome = r.reconcile(&ResourceDescriptor::new("Group", "Sales").unwrap());
            assert_eq!(outcome.status(), OutcomeStatus::Failed);
            assert_eq!(outcome.error().unwrap().classification, Classification::Permanent);
            assert!(!methods(&r).contains(&Method::Post));
            assert_eq!(outcome.attempts(), 1);
        }
    }
}
