//! Resolution of literal and Secret-backed pipeline values
//!
//! Every pass builds a fresh `ReferenceResolver`. Secrets are fetched at most
//! once per pass and cached, so all pipelines of a pass see the same snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::crd::{OtlpOutput, SecretKeyRef, ValueType};

/// Default upper bound for a single Secret lookup
pub const DEFAULT_REFERENCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("value has neither a literal nor a secret reference")]
    MissingFields,

    #[error("Secret '{name}' of Namespace '{namespace}'")]
    SecretNotFound { namespace: String, name: String },

    #[error("Key '{key}' in Secret '{name}' of Namespace '{namespace}'")]
    KeyNotFound {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("Key '{key}' in Secret '{name}' of Namespace '{namespace}' is not valid UTF-8")]
    NotUtf8 {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("timed out reading Secret '{name}' of Namespace '{namespace}'")]
    Timeout { namespace: String, name: String },

    #[error("failed to read Secret '{name}' of Namespace '{namespace}': {message}")]
    Api {
        namespace: String,
        name: String,
        message: String,
    },
}

impl ReferenceError {
    /// Transient errors are caused by the API server, not by the pipeline
    pub fn is_transient(&self) -> bool {
        matches!(self, ReferenceError::Timeout { .. } | ReferenceError::Api { .. })
    }
}

/// Read access to Secrets
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Returns `Ok(None)` when the Secret does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, String>;
}

#[async_trait]
impl SecretReader for Client {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, String> {
        let api: Api<Secret> = Api::namespaced(self.clone(), namespace);
        api.get_opt(name).await.map_err(|e| e.to_string())
    }
}

/// Secrets held in memory, used by tests and dry runs
#[derive(Default, Clone)]
pub struct StaticSecrets {
    secrets: BTreeMap<(String, String), Secret>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, namespace: &str, name: &str, data: &[(&str, &str)]) -> Self {
        self.insert(namespace, name, data, "1");
        self
    }

    pub fn insert(&mut self, namespace: &str, name: &str, data: &[(&str, &str)], version: &str) {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), k8s_openapi::ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        };
        self.secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    /// Store a key holding raw bytes
    pub fn insert_bytes(&mut self, namespace: &str, name: &str, key: &str, value: Vec<u8>) {
        let secret = self
            .secrets
            .entry((namespace.to_string(), name.to_string()))
            .or_insert_with(|| Secret {
                metadata: kube::api::ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    resource_version: Some("1".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            });
        secret
            .data
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), k8s_openapi::ByteString(value));
    }

    pub fn remove(&mut self, namespace: &str, name: &str) {
        self.secrets
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[async_trait]
impl SecretReader for StaticSecrets {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, String> {
        Ok(self
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/// Where a resolved value came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provenance {
    Literal,
    Secret(SecretKeyRef),
}

/// Materialized value of a literal or Secret-backed field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedReference {
    pub value: String,
    pub provenance: Provenance,
    /// resourceVersion of the Secret the value was read from
    pub resource_version: Option<String>,
}

impl ResolvedReference {
    pub fn literal(value: &str) -> Self {
        Self {
            value: value.to_string(),
            provenance: Provenance::Literal,
            resource_version: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedBasicAuth {
    pub user: ResolvedReference,
    pub password: ResolvedReference,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedOAuth2 {
    pub token_url: ResolvedReference,
    pub client_id: ResolvedReference,
    pub client_secret: ResolvedReference,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedHeader {
    pub name: String,
    pub prefix: Option<String>,
    pub value: ResolvedReference,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolvedTls {
    pub ca: Option<ResolvedReference>,
    pub cert: Option<ResolvedReference>,
    pub key: Option<ResolvedReference>,
}

/// All values of an OTLP output, materialized
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub endpoint: ResolvedReference,
    pub basic_auth: Option<ResolvedBasicAuth>,
    pub oauth2: Option<ResolvedOAuth2>,
    pub headers: Vec<ResolvedHeader>,
    pub tls: Option<ResolvedTls>,
}

impl ResolvedOutput {
    fn references(&self) -> Vec<&ResolvedReference> {
        let mut refs = vec![&self.endpoint];
        if let Some(basic) = &self.basic_auth {
            refs.extend([&basic.user, &basic.password]);
        }
        if let Some(oauth2) = &self.oauth2 {
            refs.extend([&oauth2.token_url, &oauth2.client_id, &oauth2.client_secret]);
        }
        refs.extend(self.headers.iter().map(|h| &h.value));
        if let Some(tls) = &self.tls {
            refs.extend([&tls.ca, &tls.cert, &tls.key].into_iter().flatten());
        }
        refs
    }

    /// Secret resourceVersions the values were read from, keyed by "namespace/name"
    pub fn freshness_tokens(&self) -> BTreeMap<String, String> {
        self.references()
            .into_iter()
            .filter_map(|r| match (&r.provenance, &r.resource_version) {
                (Provenance::Secret(s), Some(v)) => {
                    Some((format!("{}/{}", s.namespace, s.name), v.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

/// Every Secret an output points to, whether or not it exists
pub fn secret_refs(output: &OtlpOutput) -> BTreeSet<(String, String)> {
    let mut values: Vec<&ValueType> = vec![&output.endpoint];
    if let Some(auth) = &output.authentication {
        if let Some(basic) = &auth.basic {
            values.extend([&basic.user, &basic.password]);
        }
        if let Some(oauth2) = &auth.oauth2 {
            values.extend([&oauth2.token_url, &oauth2.client_id, &oauth2.client_secret]);
        }
    }
    values.extend(output.headers.iter().map(|h| &h.value));
    if let Some(tls) = &output.tls {
        values.extend([&tls.ca, &tls.cert, &tls.key].into_iter().flatten());
    }

    value_refs(values)
}

/// Secrets behind the given values, as (namespace, name)
pub fn value_refs<'a>(values: impl IntoIterator<Item = &'a ValueType>) -> BTreeSet<(String, String)> {
    values
        .into_iter()
        .filter_map(|v| v.secret_key_ref())
        .map(|r| (r.namespace.clone(), r.name.clone()))
        .collect()
}

type CachedSecret = Result<Option<Secret>, ReferenceError>;

/// Resolves pipeline values against one consistent snapshot of Secrets
pub struct ReferenceResolver<R> {
    reader: R,
    timeout: Duration,
    cache: Mutex<HashMap<(String, String), CachedSecret>>,
}

impl<R: SecretReader> ReferenceResolver<R> {
    pub fn new(reader: R, timeout: Duration) -> Self {
        Self {
            reader,
            timeout,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn fetch(&self, namespace: &str, name: &str) -> CachedSecret {
        let key = (namespace.to_string(), name.to_string());
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return hit.clone();
            }
        }

        let result = match tokio::time::timeout(self.timeout, self.reader.get_secret(namespace, name)).await {
            Ok(Ok(secret)) => Ok(secret),
            Ok(Err(message)) => Err(ReferenceError::Api {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message,
            }),
            Err(_) => Err(ReferenceError::Timeout {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        };

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, result.clone());
        }
        result
    }

    /// Resolve a single value
    pub async fn resolve(&self, value: &ValueType) -> Result<ResolvedReference, ReferenceError> {
        if let Some(literal) = value.value.as_deref().filter(|v| !v.is_empty()) {
            return Ok(ResolvedReference::literal(literal));
        }

        let secret_ref = value.secret_key_ref().ok_or(ReferenceError::MissingFields)?;
        let secret = self
            .fetch(&secret_ref.namespace, &secret_ref.name)
            .await?
            .ok_or_else(|| ReferenceError::SecretNotFound {
                namespace: secret_ref.namespace.clone(),
                name: secret_ref.name.clone(),
            })?;

        let bytes = secret.data.as_ref().and_then(|d| d.get(&secret_ref.key));
        let data = match bytes {
            Some(bytes) => String::from_utf8(bytes.0.clone()).map_err(|_| ReferenceError::NotUtf8 {
                namespace: secret_ref.namespace.clone(),
                name: secret_ref.name.clone(),
                key: secret_ref.key.clone(),
            })?,
            None => secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(&secret_ref.key))
                .cloned()
                .ok_or_else(|| ReferenceError::KeyNotFound {
                    namespace: secret_ref.namespace.clone(),
                    name: secret_ref.name.clone(),
                    key: secret_ref.key.clone(),
                })?,
        };

        debug!("Resolved {} (resourceVersion {:?})", secret_ref, secret.metadata.resource_version);

        Ok(ResolvedReference {
            value: data,
            provenance: Provenance::Secret(secret_ref.clone()),
            resource_version: secret.metadata.resource_version.clone(),
        })
    }

    async fn resolve_opt(
        &self,
        value: &Option<ValueType>,
    ) -> Result<Option<ResolvedReference>, ReferenceError> {
        match value {
            Some(v) if v.is_set() => Ok(Some(self.resolve(v).await?)),
            _ => Ok(None),
        }
    }

    /// Resolve every value of an OTLP output; the first failure wins
    #[instrument(skip(self, output))]
    pub async fn resolve_output(&self, output: &OtlpOutput) -> Result<ResolvedOutput, ReferenceError> {
        let endpoint = self.resolve(&output.endpoint).await?;

        let mut basic_auth = None;
        let mut oauth2 = None;
        if let Some(auth) = &output.authentication {
            if let Some(basic) = &auth.basic {
                basic_auth = Some(ResolvedBasicAuth {
                    user: self.resolve(&basic.user).await?,
                    password: self.resolve(&basic.password).await?,
                });
            }
            if let Some(o) = &auth.oauth2 {
                oauth2 = Some(ResolvedOAuth2 {
                    token_url: self.resolve(&o.token_url).await?,
                    client_id: self.resolve(&o.client_id).await?,
                    client_secret: self.resolve(&o.client_secret).await?,
                });
            }
        }

        let mut headers = Vec::with_capacity(output.headers.len());
        for header in &output.headers {
            headers.push(ResolvedHeader {
                name: header.name.clone(),
                prefix: header.prefix.clone(),
                value: self.resolve(&header.value).await?,
            });
        }

        let tls = match &output.tls {
            Some(tls) => Some(ResolvedTls {
                ca: self.resolve_opt(&tls.ca).await?,
                cert: self.resolve_opt(&tls.cert).await?,
                key: self.resolve_opt(&tls.key).await?,
            }),
            None => None,
        };

        Ok(ResolvedOutput {
            endpoint,
            basic_auth,
            oauth2,
            headers,
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::crd::{AuthenticationOptions, BasicAuthOptions, Header, OutputTls};

    struct SlowReader;

    #[async_trait]
    impl SecretReader for SlowReader {
        async fn get_secret(&self, _: &str, _: &str) -> Result<Option<Secret>, String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }
    }

    struct CountingReader {
        inner: StaticSecrets,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SecretReader for CountingReader {
        async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.get_secret(namespace, name).await
        }
    }

    fn resolver(secrets: StaticSecrets) -> ReferenceResolver<StaticSecrets> {
        ReferenceResolver::new(secrets, DEFAULT_REFERENCE_TIMEOUT)
    }

    #[tokio::test]
    async fn test_literal_is_returned_verbatim() {
        let r = resolver(StaticSecrets::new());
        let resolved = r.resolve(&ValueType::literal("http://x:4317")).await.unwrap();

        assert_eq!(resolved.value, "http://x:4317");
        assert_eq!(resolved.provenance, Provenance::Literal);
        assert!(resolved.resource_version.is_none());
    }

    #[tokio::test]
    async fn test_secret_value_is_resolved_with_version() {
        let r = resolver(StaticSecrets::new().with("ns", "backend", &[("endpoint", "http://b:4317")]));
        let resolved = r
            .resolve(&ValueType::from_secret("backend", "ns", "endpoint"))
            .await
            .unwrap();

        assert_eq!(resolved.value, "http://b:4317");
        assert_eq!(resolved.resource_version.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_missing_secret_and_key_are_distinguished() {
        let r = resolver(StaticSecrets::new().with("ns", "backend", &[("endpoint", "x")]));

        let err = r
            .resolve(&ValueType::from_secret("other", "ns", "endpoint"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReferenceError::SecretNotFound { .. }));

        let err = r
            .resolve(&ValueType::from_secret("backend", "ns", "token"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReferenceError::KeyNotFound { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_non_utf8_value_is_rejected() {
        let mut secrets = StaticSecrets::new();
        secrets.insert_bytes("ns", "backend", "password", vec![0x70, 0x77, 0xff, 0xfe]);
        let r = resolver(secrets);

        let err = r
            .resolve(&ValueType::from_secret("backend", "ns", "password"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReferenceError::NotUtf8 { .. }));
        assert!(!err.is_transient());
        assert!(err.to_string().contains("not valid UTF-8"));
    }

    #[tokio::test]
    async fn test_empty_value_is_missing_fields() {
        let r = resolver(StaticSecrets::new());
        let err = r.resolve(&ValueType::default()).await.unwrap_err();
        assert_eq!(err, ReferenceError::MissingFields);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_lookup_times_out() {
        let r = ReferenceResolver::new(SlowReader, Duration::from_secs(1));
        let err = r
            .resolve(&ValueType::from_secret("s", "ns", "k"))
            .await
            .unwrap_err();

        assert!(matches!(err, ReferenceError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_secret_is_fetched_once_per_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let r = ReferenceResolver::new(
            CountingReader {
                inner: StaticSecrets::new().with("ns", "creds", &[("user", "u"), ("password", "p")]),
                calls: calls.clone(),
            },
            DEFAULT_REFERENCE_TIMEOUT,
        );

        r.resolve(&ValueType::from_secret("creds", "ns", "user")).await.unwrap();
        r.resolve(&ValueType::from_secret("creds", "ns", "password")).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_output_collects_freshness_tokens() {
        let secrets = StaticSecrets::new()
            .with("ns", "creds", &[("user", "u"), ("password", "p")])
            .with("ns", "token", &[("value", "abc")]);
        let output = OtlpOutput {
            endpoint: ValueType::literal("https://backend:4317"),
            authentication: Some(AuthenticationOptions {
                basic: Some(BasicAuthOptions {
                    user: ValueType::from_secret("creds", "ns", "user"),
                    password: ValueType::from_secret("creds", "ns", "password"),
                }),
                oauth2: None,
            }),
            headers: vec![Header {
                name: "Authorization".to_string(),
                prefix: Some("Bearer".to_string()),
                value: ValueType::from_secret("token", "ns", "value"),
            }],
            tls: Some(OutputTls {
                insecure: true,
                ..Default::default()
            }),
            ..Default::default()
        };

        let resolved = resolver(secrets).resolve_output(&output).await.unwrap();

        assert_eq!(resolved.basic_auth.as_ref().unwrap().password.value, "p");
        assert_eq!(resolved.headers[0].value.value, "abc");
        assert_eq!(resolved.tls, Some(ResolvedTls::default()));
        let tokens = resolved.freshness_tokens();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.get("ns/creds").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_secret_refs_lists_every_reference() {
        let output = OtlpOutput {
            endpoint: ValueType::from_secret("endpoint", "a", "url"),
            tls: Some(OutputTls {
                cert: Some(ValueType::from_secret("tls", "b", "crt")),
                key: Some(ValueType::from_secret("tls", "b", "key")),
                ..Default::default()
            }),
            ..Default::default()
        };

        let refs = secret_refs(&output);
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&("a".to_string(), "endpoint".to_string())));
        assert!(refs.contains(&("b".to_string(), "tls".to_string())));
    }
}
