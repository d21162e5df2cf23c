//! Per-kind resource operations on top of the transport.
//!
//! Two addressing styles cover the management APIs in use:
//! - `Post`: Graph-style collections. Lookup is a `$filter` query on the key
//!   field, create is a POST to the collection, IDs are server-generated.
//! - `Put`: ARM-style named resources. The natural key is the last path
//!   segment, lookup is a GET on that path (404 means absent), create is a
//!   PUT to the same path.

use std::collections::BTreeMap;

use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::descriptor::ResourceDescriptor;
use crate::error::{ConfigError, ErrorInfo, RequestError};
use crate::transport::{Method, Request, Transport, parse_absolute, parse_header};
use reqwest::header::{HeaderName, HeaderValue};

/// Upper bound on `nextLink` pages followed for one lookup.
pub const MAX_PAGES: usize = 100;

/// A resource as returned by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResource {
    pub id: String,
    pub properties: Map<String, Value>,
}

/// Kind-specific find/create/update.
pub trait ResourceApi {
    /// Every resource of `kind` whose key field equals `natural_key`.
    fn find_by_key(&self, kind: &str, natural_key: &str) -> Result<Vec<RemoteResource>, ErrorInfo>;

    fn create(&self, descriptor: &ResourceDescriptor) -> Result<RemoteResource, ErrorInfo>;

    /// Apply `changes` to the existing resource `id`.
    fn update(
        &self,
        descriptor: &ResourceDescriptor,
        id: &str,
        changes: &Map<String, Value>,
    ) -> Result<(), ErrorInfo>;

    /// Whether repeating `create` can never produce a second resource.
    fn create_is_idempotent(&self, _kind: &str) -> bool {
        false
    }
}

impl<A: ResourceApi + ?Sized> ResourceApi for &A {
    fn find_by_key(&self, kind: &str, natural_key: &str) -> Result<Vec<RemoteResource>, ErrorInfo> {
        (**self).find_by_key(kind, natural_key)
    }

    fn create(&self, descriptor: &ResourceDescriptor) -> Result<RemoteResource, ErrorInfo> {
        (**self).create(descriptor)
    }

    fn update(
        &self,
        descriptor: &ResourceDescriptor,
        id: &str,
        changes: &Map<String, Value>,
    ) -> Result<(), ErrorInfo> {
        (**self).update(descriptor, id, changes)
    }

    fn create_is_idempotent(&self, kind: &str) -> bool {
        (**self).create_is_idempotent(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreateStyle {
    #[default]
    Post,
    Put,
}

/// On-disk shape of a kind definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KindConfig {
    pub collection: String,
    #[serde(default = "default_key_field")]
    pub key_field: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default)]
    pub create: CreateStyle,
    #[serde(default)]
    pub api_version: Option<String>,
    /// Extra headers sent with every request for this kind, e.g.
    /// `ConsistencyLevel: eventual` for Graph advanced queries.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_key_field() -> String {
    "displayName".to_string()
}

fn default_id_field() -> String {
    "id".to_string()
}

/// How to address one resource kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindSpec {
    collection: Url,
    key_field: String,
    id_field: String,
    create: CreateStyle,
    api_version: Option<String>,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl KindSpec {
    pub fn new(collection: &str, key_field: &str, create: CreateStyle) -> Result<Self, RequestError> {
        Ok(Self {
            collection: parse_absolute(collection)?,
            key_field: key_field.to_string(),
            id_field: default_id_field(),
            create,
            api_version: None,
            headers: Vec::new(),
        })
    }

    pub fn from_config(kind: &str, config: KindConfig) -> Result<Self, ConfigError> {
        if config.key_field.trim().is_empty() {
            return Err(ConfigError::EmptyKeyField(kind.to_string()));
        }
        let collection =
            parse_absolute(&config.collection).map_err(|source| ConfigError::InvalidCollection {
                kind: kind.to_string(),
                source,
            })?;
        let headers = config
            .headers
            .iter()
            .map(|(name, value)| parse_header(name, value))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConfigError::InvalidHeader {
                kind: kind.to_string(),
                source,
            })?;
        Ok(Self {
            collection,
            key_field: config.key_field,
            id_field: config.id_field,
            create: config.create,
            api_version: config.api_version,
            headers,
        })
    }

    pub fn with_api_version(mut self, api_version: &str) -> Self {
        self.api_version = Some(api_version.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, RequestError> {
        self.headers.push(parse_header(name, value)?);
        Ok(self)
    }

    /// `{collection}/{segment}`, with the segment percent-encoded.
    fn child_url(&self, segment: &str) -> Result<Url, ErrorInfo> {
        let mut url = self.collection.clone();
        url.path_segments_mut()
            .map_err(|_| ErrorInfo::permanent(format!("Cannot append to {}", self.collection)))?
            .pop_if_empty()
            .push(segment);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> Request {
        let request = self
            .headers
            .iter()
            .cloned()
            .fold(Request::from_url(method, url), Request::with_parsed_header);
        match &self.api_version {
            Some(v) => request.query("api-version", v),
            None => request,
        }
    }

    fn to_remote(&self, value: Value) -> Result<RemoteResource, ErrorInfo> {
        let Value::Object(properties) = value else {
            return Err(ErrorInfo::unknown("Expected a JSON object for a resource"));
        };
        let id = properties
            .get(&self.id_field)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ErrorInfo::unknown(format!("Resource is missing its '{}' field", self.id_field))
            })?
            .to_string();
        Ok(RemoteResource { id, properties })
    }

    fn key_matches(&self, properties: &Map<String, Value>, natural_key: &str) -> bool {
        properties
            .get(&self.key_field)
            .and_then(Value::as_str)
            .is_some_and(|k| k.to_lowercase() == natural_key.to_lowercase())
    }
}

/// Validated set of kind definitions.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, KindSpec>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: BTreeMap<String, KindConfig>) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (kind, config) in configs {
            let spec = KindSpec::from_config(&kind, config)?;
            registry.insert(kind, spec);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, kind: impl Into<String>, spec: KindSpec) {
        self.kinds.insert(kind.into(), spec);
    }

    pub fn get(&self, kind: &str) -> Option<&KindSpec> {
        self.kinds.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }
}

/// Escape a string literal for an OData `$filter` expression.
pub fn odata_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `ResourceApi` over HTTP.
pub struct RestResourceApi<T> {
    transport: T,
    kinds: KindRegistry,
}

impl<T: Transport> RestResourceApi<T> {
    pub fn new(transport: T, kinds: KindRegistry) -> Self {
        Self { transport, kinds }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn kinds(&self) -> &KindRegistry {
        &self.kinds
    }

    fn spec(&self, kind: &str) -> Result<&KindSpec, ErrorInfo> {
        self.kinds
            .get(kind)
            .ok_or_else(|| ErrorInfo::permanent(format!("Unknown resource kind '{}'", kind)))
    }

    /// Identify a resource whose create succeeded without a response body
    /// (ARM long-running PUTs answer 202 Accepted with nothing in it).
    fn resolve_created(
        &self,
        spec: &KindSpec,
        descriptor: &ResourceDescriptor,
    ) -> Result<RemoteResource, ErrorInfo> {
        let kind = descriptor.kind();
        let key = descriptor.natural_key();

        if spec.create == CreateStyle::Put {
            // The ARM resource ID is the path the PUT went to.
            let id = spec.child_url(key)?.path().to_string();
            debug!(kind, key, id = %id, "Create accepted without body");
            return Ok(RemoteResource {
                id,
                properties: descriptor.desired_properties().clone(),
            });
        }

        let mut found = self.find_by_key(kind, key)?;
        match found.len() {
            1 => found
                .pop()
                .ok_or_else(|| ErrorInfo::unknown("Lookup result vanished")),
            // Not retryable: another POST could leave two copies.
            0 => Err(ErrorInfo::ambiguous(format!(
                "Create of {} '{}' returned no body and the resource is not listed yet",
                kind, key
            ))),
            n => Err(ErrorInfo::ambiguous(format!(
                "{} resources match {} '{}' after create",
                n, kind, key
            ))),
        }
    }

    /// GET a collection and follow `nextLink` pagination.
    fn collect_values(&self, first: Request) -> Result<Vec<Value>, ErrorInfo> {
        let mut items = Vec::new();
        let mut request = first;

        for _ in 0..MAX_PAGES {
            let page = self
                .transport
                .send(&request)?
                .into_json()
                .ok_or_else(|| ErrorInfo::unknown("Collection query returned no body"))?;

            match page.get("value") {
                Some(Value::Array(values)) => items.extend(values.iter().cloned()),
                _ => return Err(ErrorInfo::unknown("Expected a 'value' array in collection response")),
            }

            let next = page
                .get("@odata.nextLink")
                .or_else(|| page.get("nextLink"))
                .and_then(Value::as_str);
            match next {
                Some(link) => {
                    let url = parse_absolute(link).map_err(|e| ErrorInfo::unknown(e.to_string()))?;
                    request = Request::from_url(Method::Get, url);
                }
                None => return Ok(items),
            }
        }

        warn!(pages = MAX_PAGES, items = items.len(), "Lookup still has more pages");
        Err(ErrorInfo::permanent(format!(
            "Lookup truncated after {} pages; a partial listing cannot prove absence",
            MAX_PAGES
        )))
    }
}

impl<T: Transport> ResourceApi for RestResourceApi<T> {
    fn find_by_key(&self, kind: &str, natural_key: &str) -> Result<Vec<RemoteResource>, ErrorInfo> {
        let spec = self.spec(kind)?;

        match spec.create {
            CreateStyle::Post => {
                let filter = format!("{} eq {}", spec.key_field, odata_quote(natural_key));
                let request = spec
                    .request(Method::Get, spec.collection.clone())
                    .query("$filter", &filter);
                let values = self.collect_values(request)?;
                let total = values.len();

                let mut matches = Vec::new();
                for value in values {
                    let remote = spec.to_remote(value)?;
                    if spec.key_matches(&remote.properties, natural_key) {
                        matches.push(remote);
                    }
                }
                debug!(kind, key = natural_key, returned = total, matched = matches.len(), "Lookup");
                Ok(matches)
            }
            CreateStyle::Put => {
                let request = spec.request(Method::Get, spec.child_url(natural_key)?);
                match self.transport.send(&request) {
                    Ok(response) => {
                        let value = response
                            .into_json()
                            .ok_or_else(|| ErrorInfo::unknown("Resource GET returned no body"))?;
                        Ok(vec![spec.to_remote(value)?])
                    }
                    Err(e) if e.is_not_found() => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn create(&self, descriptor: &ResourceDescriptor) -> Result<RemoteResource, ErrorInfo> {
        let spec = self.spec(descriptor.kind())?;
        let mut body = descriptor.desired_properties().clone();

        let request = match spec.create {
            CreateStyle::Post => {
                body.entry(spec.key_field.clone())
                    .or_insert_with(|| Value::String(descriptor.natural_key().to_string()));
                spec.request(Method::Post, spec.collection.clone())
            }
            CreateStyle::Put => spec.request(Method::Put, spec.child_url(descriptor.natural_key())?),
        };
        let request = request
            .json(&body)
            .map_err(|e| ErrorInfo::permanent(e.to_string()))?;

        match self.transport.send(&request)?.into_json() {
            Some(value) => spec.to_remote(value),
            None => self.resolve_created(spec, descriptor),
        }
    }

    fn update(
        &self,
        descriptor: &ResourceDescriptor,
        id: &str,
        changes: &Map<String, Value>,
    ) -> Result<(), ErrorInfo> {
        let spec = self.spec(descriptor.kind())?;
        let url = match spec.create {
            CreateStyle::Post => spec.child_url(id)?,
            CreateStyle::Put => spec.child_url(descriptor.natural_key())?,
        };
        let request = spec
            .request(Method::Patch, url)
            .json(changes)
            .map_err(|e| ErrorInfo::permanent(e.to_string()))?;
        self.transport.send(&request)?;
        Ok(())
    }

    fn create_is_idempotent(&self, kind: &str) -> bool {
        self.kinds
            .get(kind)
            .is_some_and(|s| s.create == CreateStyle::Put)
    }
}
