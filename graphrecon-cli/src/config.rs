//! Plan file loading and validation.
//!
//! A plan is parsed and checked once, up front. Anything malformed (unknown
//! kinds, empty keys, forward dependencies, bad probe URIs) fails here
//! rather than halfway through a run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use graphrecon_core::{ConfigError, KindConfig, KindRegistry, ResourceDescriptor, RetryPolicy, UpdateMode};
use graphrecon_core::transport::parse_absolute;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Poll interval when a step does not set one.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
/// Max wait when a step does not set one.
const DEFAULT_MAX_WAIT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse plan {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid kind definition: {0}")]
    Kind(#[source] ConfigError),

    #[error("Step '{step}': {source}")]
    Step {
        step: String,
        #[source]
        source: ConfigError,
    },

    #[error("Step '{step}' uses undeclared kind '{kind}'")]
    UnknownKind { step: String, kind: String },

    #[error("Step id '{0}' is used more than once")]
    DuplicateStep(String),

    #[error("Step '{step}' depends on '{dependency}', which is not an earlier step")]
    UnknownDependency { step: String, dependency: String },

    #[error("Step '{step}' has an invalid probe: {reason}")]
    InvalidProbe { step: String, reason: String },
}

/// On-disk plan.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanFile {
    #[serde(default)]
    retry: RetryPolicy,
    kinds: BTreeMap<String, KindConfig>,
    #[serde(default)]
    resources: Vec<StepFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFile {
    #[serde(default)]
    id: Option<String>,
    kind: String,
    natural_key: String,
    #[serde(default)]
    properties: Map<String, Value>,
    #[serde(default)]
    update: bool,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    propagation: Option<PropagationFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PropagationFile {
    probe: ProbeConfig,
    #[serde(default = "default_poll_interval_secs")]
    poll_interval_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    max_wait_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_max_wait_secs() -> u64 {
    DEFAULT_MAX_WAIT_SECS
}

/// How readiness is checked after a change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeConfig {
    /// The resource shows up in a natural-key lookup.
    Visible,
    /// GET `uri` (`{id}` and `{key}` are substituted) until it succeeds and,
    /// if given, the value at `pointer` equals `equals`.
    Http {
        uri: String,
        #[serde(default)]
        pointer: Option<String>,
        #[serde(default)]
        equals: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropagationSpec {
    pub probe: ProbeConfig,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

/// One validated reconciliation step.
#[derive(Debug, Clone)]
pub struct Step {
    pub id: String,
    pub descriptor: ResourceDescriptor,
    pub update: UpdateMode,
    pub depends_on: Vec<String>,
    pub propagation: Option<PropagationSpec>,
}

/// A validated plan, ready to run.
#[derive(Debug)]
pub struct Plan {
    pub retry: RetryPolicy,
    pub kinds: KindRegistry,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|e| match e {
            PlanError::Parse { source, .. } => PlanError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, PlanError> {
        let file: PlanFile = serde_json::from_str(text).map_err(|source| PlanError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Self::validate(file)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    fn validate(file: PlanFile) -> Result<Self, PlanError> {
        let kinds = KindRegistry::from_configs(file.kinds).map_err(PlanError::Kind)?;
        let mut seen: HashSet<String> = HashSet::new();
        let mut steps = Vec::with_capacity(file.resources.len());

        for raw in file.resources {
            let id = raw
                .id
                .clone()
                .unwrap_or_else(|| format!("{}/{}", raw.kind, raw.natural_key));

            if !kinds.contains(&raw.kind) {
                return Err(PlanError::UnknownKind {
                    step: id,
                    kind: raw.kind,
                });
            }
            if seen.contains(&id) {
                return Err(PlanError::DuplicateStep(id));
            }
            if let Some(dependency) = raw.depends_on.iter().find(|d| !seen.contains(*d)) {
                return Err(PlanError::UnknownDependency {
                    step: id,
                    dependency: dependency.clone(),
                });
            }

            let descriptor = ResourceDescriptor::new(raw.kind, raw.natural_key)
                .map_err(|source| PlanError::Step {
                    step: id.clone(),
                    source,
                })?
                .with_properties(raw.properties);

            let propagation = raw
                .propagation
                .map(|p| validate_propagation(&id, p))
                .transpose()?;

            seen.insert(id.clone());
            steps.push(Step {
                id,
                descriptor,
                update: if raw.update {
                    UpdateMode::Patch
                } else {
                    UpdateMode::Skip
                },
                depends_on: raw.depends_on,
                propagation,
            });
        }

        Ok(Self {
            retry: file.retry,
            kinds,
            steps,
        })
    }
}

fn validate_propagation(step: &str, p: PropagationFile) -> Result<PropagationSpec, PlanError> {
    let step_error = |source| PlanError::Step {
        step: step.to_string(),
        source,
    };
    if p.poll_interval_secs == 0 {
        return Err(step_error(ConfigError::ZeroPollInterval));
    }
    if p.poll_interval_secs > p.max_wait_secs {
        return Err(step_error(ConfigError::PollIntervalExceedsMaxWait {
            interval_secs: p.poll_interval_secs,
            max_wait_secs: p.max_wait_secs,
        }));
    }

    if let ProbeConfig::Http {
        uri,
        pointer,
        equals,
    } = &p.probe
    {
        let invalid = |reason: String| PlanError::InvalidProbe {
            step: step.to_string(),
            reason,
        };
        let sample = expand_uri(uri, "00000000-0000-0000-0000-000000000000", "key");
        parse_absolute(&sample).map_err(|e| invalid(e.to_string()))?;
        if pointer.is_some() != equals.is_some() {
            return Err(invalid("'pointer' and 'equals' must be given together".to_string()));
        }
        if let Some(ptr) = pointer
            && !ptr.starts_with('/')
        {
            return Err(invalid(format!("JSON pointer '{}' must start with '/'", ptr)));
        }
    }

    Ok(PropagationSpec {
        probe: p.probe,
        poll_interval: Duration::from_secs(p.poll_interval_secs),
        max_wait: Duration::from_secs(p.max_wait_secs),
    })
}

/// Substitute `{id}` and `{key}` in a probe URI template.
///
/// Both values are percent-encoded. `/` in an ID is kept, so ARM resource
/// IDs can stand in for a whole path.
pub fn expand_uri(template: &str, id: &str, key: &str) -> String {
    let id = id.split('/').map(encode_component).collect::<Vec<_>>().join("/");
    template
        .replace("{id}", &id)
        .replace("{key}", &encode_component(key))
}

fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const KINDS: &str = r#"
        "kinds": {
            "NamedLocation": {
                "collection": "https://graph.microsoft.com/v1.0/identity/conditionalAccess/namedLocations"
            },
            "StorageAccount": {
                "collection": "https://management.azure.com/subscriptions/s/resourceGroups/rg/providers/Microsoft.Storage/storageAccounts",
                "key_field": "name",
                "create": "put",
                "api_version": "2023-01-01"
            }
        }
    "#;

    fn plan(resources: &str) -> Result<Plan, PlanError> {
        Plan::from_json(&format!("{{ {}, \"resources\": {} }}", KINDS, resources))
    }

    #[test]
    fn test_valid_plan() {
        let p = plan(
            r#"[
                {"id": "office", "kind": "NamedLocation", "natural_key": "Office Locations",
                 "properties": {"isTrusted": true},
                 "propagation": {"probe": {"type": "visible"}, "poll_interval_secs": 2, "max_wait_secs": 30}},
                {"kind": "StorageAccount", "natural_key": "labstore01", "depends_on": ["office"], "update": true,
                 "propagation": {"probe": {"type": "http", "uri": "https://management.azure.com{id}?api-version=2023-01-01",
                                           "pointer": "/properties/provisioningState", "equals": "Succeeded"}}}
            ]"#,
        )
        .unwrap();

        assert_eq!(p.retry, RetryPolicy::default());
        assert_eq!(p.steps.len(), 2);
        assert_eq!(p.steps[0].id, "office");
        assert_eq!(p.steps[0].update, UpdateMode::Skip);
        assert_eq!(
            p.steps[0].propagation.as_ref().unwrap().poll_interval,
            Duration::from_secs(2)
        );
        assert_eq!(p.steps[1].id, "StorageAccount/labstore01");
        assert_eq!(p.steps[1].update, UpdateMode::Patch);
        assert_eq!(
            p.steps[1].propagation.as_ref().unwrap().max_wait,
            Duration::from_secs(DEFAULT_MAX_WAIT_SECS)
        );
        assert!(p.step("office").is_some());
    }

    #[test]
    fn test_unknown_kind() {
        let err = plan(r#"[{"kind": "Sentinel", "natural_key": "x"}]"#).unwrap_err();
        assert!(matches!(err, PlanError::UnknownKind { kind, .. } if kind == "Sentinel"));
    }

    #[test]
    fn test_empty_natural_key() {
        let err = plan(r#"[{"kind": "NamedLocation", "natural_key": ""}]"#).unwrap_err();
        assert!(matches!(
            err,
            PlanError::Step {
                source: ConfigError::EmptyNaturalKey(_),
                ..
            }
        ));
    }

    #[test]
    fn test_forward_dependency_rejected() {
        let err = plan(
            r#"[
                {"id": "a", "kind": "NamedLocation", "natural_key": "A", "depends_on": ["b"]},
                {"id": "b", "kind": "NamedLocation", "natural_key": "B"}
            ]"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { dependency, .. } if dependency == "b"));
    }

    #[test]
    fn test_duplicate_step_id() {
        let err = plan(
            r#"[
                {"kind": "NamedLocation", "natural_key": "A"},
                {"kind": "NamedLocation", "natural_key": "A"}
            ]"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::DuplicateStep(id) if id == "NamedLocation/A"));
    }

    #[test]
    fn test_bad_probe() {
        let err = plan(
            r#"[{"kind": "NamedLocation", "natural_key": "A",
                 "propagation": {"probe": {"type": "http", "uri": "/relative/{id}"}}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidProbe { .. }));

        let err = plan(
            r#"[{"kind": "NamedLocation", "natural_key": "A",
                 "propagation": {"probe": {"type": "http", "uri": "https://x/{id}", "pointer": "/state"}}}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidProbe { .. }));
    }

    #[test]
    fn test_poll_interval_bounds() {
        let err = plan(
            r#"[{"kind": "NamedLocation", "natural_key": "A",
                 "propagation": {"probe": {"type": "visible"}, "poll_interval_secs": 0}}]"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PlanError::Step {
                source: ConfigError::ZeroPollInterval,
                ..
            }
        ));

        let err = plan(
            r#"[{"kind": "NamedLocation", "natural_key": "A",
                 "propagation": {"probe": {"type": "visible"}, "poll_interval_secs": 60, "max_wait_secs": 10}}]"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PlanError::Step {
                source: ConfigError::PollIntervalExceedsMaxWait { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = plan(r#"[{"kind": "NamedLocation", "natural_key": "A", "displayname": "typo"}]"#)
            .unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = Plan::from_json(&format!(
            "{{ \"retry\": {{\"max_attempts\": 0}}, {}, \"resources\": [] }}",
            KINDS
        ))
        .unwrap_err();
        assert!(matches!(err, PlanError::Parse { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{{ {}, \"resources\": [{{\"kind\": \"NamedLocation\", \"natural_key\": \"A\"}}] }}",
            KINDS
        )
        .unwrap();

        let p = Plan::load(file.path()).unwrap();
        assert_eq!(p.steps.len(), 1);

        let err = Plan::load(Path::new("/nonexistent/plan.json")).unwrap_err();
        assert!(matches!(err, PlanError::Read { .. }));
    }

    #[test]
    fn test_expand_uri_encodes_values() {
        assert_eq!(
            expand_uri("https://graph.test/state?name={key}&x=1", "", "R&D #1?"),
            "https://graph.test/state?name=R%26D%20%231%3F&x=1"
        );
        assert_eq!(
            expand_uri(
                "https://management.azure.com{id}?api-version=2023-01-01",
                "/subscriptions/s/resourceGroups/my rg/providers/Microsoft.Storage/storageAccounts/lab01",
                "lab01"
            ),
            "https://management.azure.com/subscriptions/s/resourceGroups/my%20rg/providers/Microsoft.Storage/storageAccounts/lab01?api-version=2023-01-01"
        );
    }

    #[test]
    fn test_expand_uri() {
        assert_eq!(
            expand_uri("https://graph.microsoft.com/beta/{id}?k={key}", "abc", "Sales"),
            "https://graph.microsoft.com/beta/abc?k=Sales"
        );
    }
}
