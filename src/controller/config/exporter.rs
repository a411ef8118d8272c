//! OTLP exporter configuration and its credential environment
//!
//! Secret values never appear in the rendered document. The exporter refers
//! to environment variables which are filled from a generated Secret.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use url::Url;

use super::types::{
    env_ref, Authenticator, ExporterTls, OAuth2Extension, OtlpExporter, RetryOnFailure,
    SendingQueue,
};
use crate::controller::secret_ref::ResolvedOutput;
use crate::controller::tls_cert::sanitize_pem;
use crate::crd::{OtlpOutput, OtlpProtocol};
use crate::error::{Error, Result};

const BASIC_AUTH_HEADER_PREFIX: &str = "BASIC_AUTH_HEADER";
const OTLP_ENDPOINT_PREFIX: &str = "OTLP_ENDPOINT";
const TLS_CERT_PREFIX: &str = "OTLP_TLS_CERT_PEM";
const TLS_KEY_PREFIX: &str = "OTLP_TLS_KEY_PEM";
const TLS_CA_PREFIX: &str = "OTLP_TLS_CA_PEM";
const OAUTH2_TOKEN_URL_PREFIX: &str = "OAUTH2_TOKEN_URL";
const OAUTH2_CLIENT_ID_PREFIX: &str = "OAUTH2_CLIENT_ID";
const OAUTH2_CLIENT_SECRET_PREFIX: &str = "OAUTH2_CLIENT_SECRET";

/// Component id of a pipeline's exporter
pub fn exporter_id(protocol: OtlpProtocol, pipeline: &str) -> String {
    match protocol {
        OtlpProtocol::Grpc => format!("otlp/{pipeline}"),
        OtlpProtocol::Http => format!("otlphttp/{pipeline}"),
    }
}

pub fn oauth2_extension_id(pipeline: &str) -> String {
    format!("oauth2client/{pipeline}")
}

/// Upper-case, with `.` and `-` turned into `_`
pub fn sanitize_env_var_name(input: &str) -> String {
    input.to_uppercase().replace(['.', '-'], "_")
}

fn env_var_key(prefix: &str, pipeline: &str) -> String {
    format!("{prefix}_{}", sanitize_env_var_name(pipeline))
}

fn header_env_var_key(pipeline: &str, header: &str) -> String {
    format!(
        "HEADER_{}_{}",
        sanitize_env_var_name(pipeline),
        sanitize_env_var_name(header)
    )
}

fn basic_auth_header(user: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{user}:{password}")))
}

/// Append the output path to the endpoint URL
fn endpoint_with_path(endpoint: &str, path: Option<&str>) -> Result<String> {
    let Some(path) = path.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(endpoint.to_string());
    };
    let mut url = Url::parse(endpoint)
        .map_err(|e| Error::SynthesisError(format!("cannot append path to endpoint: {e}")))?;
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    Ok(url.to_string())
}

/// Everything one pipeline's exporter contributes to a document
#[derive(Clone, Debug)]
pub struct ExporterParts {
    pub id: String,
    pub config: OtlpExporter,
    pub env: BTreeMap<String, Vec<u8>>,
    pub extension: Option<(String, OAuth2Extension)>,
}

pub fn build_exporter(
    pipeline: &str,
    output: &OtlpOutput,
    resolved: &ResolvedOutput,
    queue_size: u32,
) -> Result<ExporterParts> {
    let mut env = BTreeMap::new();
    let mut headers = BTreeMap::new();

    let endpoint_key = env_var_key(OTLP_ENDPOINT_PREFIX, pipeline);
    let endpoint = endpoint_with_path(&resolved.endpoint.value, output.path.as_deref())?;
    env.insert(endpoint_key.clone(), endpoint.into_bytes());

    if let Some(basic) = &resolved.basic_auth {
        let key = env_var_key(BASIC_AUTH_HEADER_PREFIX, pipeline);
        env.insert(
            key.clone(),
            basic_auth_header(&basic.user.value, &basic.password.value).into_bytes(),
        );
        headers.insert("Authorization".to_string(), env_ref(&key));
    }

    for header in &resolved.headers {
        let key = header_env_var_key(pipeline, &header.name);
        let value = match header.prefix.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(prefix) => format!("{prefix} {}", header.value.value),
            None => header.value.value.clone(),
        };
        env.insert(key.clone(), value.into_bytes());
        headers.insert(header.name.clone(), env_ref(&key));
    }

    let spec_tls = output.tls.clone().unwrap_or_default();
    let mut tls = ExporterTls {
        insecure: spec_tls.insecure,
        insecure_skip_verify: spec_tls.insecure_skip_verify,
        ..Default::default()
    };
    if let Some(resolved_tls) = &resolved.tls {
        if let Some(ca) = &resolved_tls.ca {
            let key = env_var_key(TLS_CA_PREFIX, pipeline);
            env.insert(key.clone(), sanitize_pem(&ca.value).into_bytes());
            tls.ca_pem = Some(env_ref(&key));
        }
        if let (Some(cert), Some(private_key)) = (&resolved_tls.cert, &resolved_tls.key) {
            let cert_key = env_var_key(TLS_CERT_PREFIX, pipeline);
            let key_key = env_var_key(TLS_KEY_PREFIX, pipeline);
            env.insert(cert_key.clone(), sanitize_pem(&cert.value).into_bytes());
            env.insert(key_key.clone(), sanitize_pem(&private_key.value).into_bytes());
            tls.cert_pem = Some(env_ref(&cert_key));
            tls.key_pem = Some(env_ref(&key_key));
        }
    }

    let extension = match (&resolved.oauth2, output.authentication.as_ref().and_then(|a| a.oauth2.as_ref())) {
        (Some(resolved_oauth2), Some(spec)) => {
            let token_url = env_var_key(OAUTH2_TOKEN_URL_PREFIX, pipeline);
            let client_id = env_var_key(OAUTH2_CLIENT_ID_PREFIX, pipeline);
            let client_secret = env_var_key(OAUTH2_CLIENT_SECRET_PREFIX, pipeline);
            env.insert(token_url.clone(), resolved_oauth2.token_url.value.clone().into_bytes());
            env.insert(client_id.clone(), resolved_oauth2.client_id.value.clone().into_bytes());
            env.insert(
                client_secret.clone(),
                resolved_oauth2.client_secret.value.clone().into_bytes(),
            );
            Some((
                oauth2_extension_id(pipeline),
                OAuth2Extension {
                    token_url: env_ref(&token_url),
                    client_id: env_ref(&client_id),
                    client_secret: env_ref(&client_secret),
                    scopes: spec.scopes.clone(),
                    endpoint_params: spec.params.clone(),
                },
            ))
        }
        _ => None,
    };

    Ok(ExporterParts {
        id: exporter_id(output.protocol, pipeline),
        config: OtlpExporter {
            endpoint: env_ref(&endpoint_key),
            headers,
            tls,
            sending_queue: SendingQueue {
                enabled: true,
                queue_size,
            },
            retry_on_failure: RetryOnFailure::default(),
            auth: extension.as_ref().map(|(id, _)| Authenticator {
                authenticator: id.clone(),
            }),
        },
        env,
        extension,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::secret_ref::{
        ResolvedBasicAuth, ResolvedHeader, ResolvedOAuth2, ResolvedReference, ResolvedTls,
    };
    use crate::crd::{AuthenticationOptions, OAuth2Options, ValueType};

    fn lit(v: &str) -> ResolvedReference {
        ResolvedReference::literal(v)
    }

    fn resolved(endpoint: &str) -> ResolvedOutput {
        ResolvedOutput {
            endpoint: lit(endpoint),
            basic_auth: None,
            oauth2: None,
            headers: vec![],
            tls: None,
        }
    }

    fn output(protocol: OtlpProtocol) -> OtlpOutput {
        OtlpOutput {
            protocol,
            endpoint: ValueType::literal("unused"),
            ..Default::default()
        }
    }

    fn env_str(parts: &ExporterParts, key: &str) -> String {
        String::from_utf8(parts.env[key].clone()).unwrap()
    }

    #[test]
    fn test_env_var_names_are_sanitized() {
        assert_eq!(sanitize_env_var_name("my-pipeline.v2"), "MY_PIPELINE_V2");
        assert_eq!(header_env_var_key("a-b", "x-token"), "HEADER_A_B_X_TOKEN");
    }

    #[test]
    fn test_endpoint_goes_through_env() {
        let parts = build_exporter(
            "backend",
            &output(OtlpProtocol::Grpc),
            &resolved("http://backend:4317"),
            128,
        )
        .unwrap();

        assert_eq!(parts.id, "otlp/backend");
        assert_eq!(parts.config.endpoint, "${OTLP_ENDPOINT_BACKEND}");
        assert_eq!(env_str(&parts, "OTLP_ENDPOINT_BACKEND"), "http://backend:4317");
        assert_eq!(parts.config.sending_queue.queue_size, 128);
        assert!(parts.config.auth.is_none());
    }

    #[test]
    fn test_http_path_is_joined() {
        let mut out = output(OtlpProtocol::Http);
        out.path = Some("/v1/logs".to_string());
        let parts = build_exporter("b", &out, &resolved("https://ingest.example.com/otlp/"), 256)
            .unwrap();

        assert_eq!(parts.id, "otlphttp/b");
        assert_eq!(
            env_str(&parts, "OTLP_ENDPOINT_B"),
            "https://ingest.example.com/otlp/v1/logs"
        );
    }

    #[test]
    fn test_basic_auth_and_headers() {
        let mut r = resolved("http://backend:4317");
        r.basic_auth = Some(ResolvedBasicAuth {
            user: lit("user"),
            password: lit("pass"),
        });
        r.headers = vec![ResolvedHeader {
            name: "X-Token".to_string(),
            prefix: Some(" Bearer ".to_string()),
            value: lit("abc"),
        }];

        let parts = build_exporter("p", &output(OtlpProtocol::Grpc), &r, 256).unwrap();

        assert_eq!(env_str(&parts, "BASIC_AUTH_HEADER_P"), "Basic dXNlcjpwYXNz");
        assert_eq!(parts.config.headers["Authorization"], "${BASIC_AUTH_HEADER_P}");
        assert_eq!(env_str(&parts, "HEADER_P_X_TOKEN"), "Bearer abc");
        assert_eq!(parts.config.headers["X-Token"], "${HEADER_P_X_TOKEN}");
    }

    #[test]
    fn test_tls_material_is_sanitized() {
        let mut r = resolved("https://backend:4317");
        r.tls = Some(ResolvedTls {
            ca: Some(lit("-----BEGIN CERTIFICATE-----\\nCA")),
            cert: Some(lit("cert")),
            key: Some(lit("key")),
        });

        let parts = build_exporter("p", &output(OtlpProtocol::Grpc), &r, 256).unwrap();

        assert_eq!(
            env_str(&parts, "OTLP_TLS_CA_PEM_P"),
            "-----BEGIN CERTIFICATE-----\nCA"
        );
        assert_eq!(parts.config.tls.cert_pem.as_deref(), Some("${OTLP_TLS_CERT_PEM_P}"));
        assert_eq!(parts.config.tls.key_pem.as_deref(), Some("${OTLP_TLS_KEY_PEM_P}"));
    }

    #[test]
    fn test_oauth2_adds_extension() {
        let mut out = output(OtlpProtocol::Grpc);
        out.authentication = Some(AuthenticationOptions {
            basic: None,
            oauth2: Some(OAuth2Options {
                token_url: ValueType::literal("https://auth/token"),
                client_id: ValueType::literal("id"),
                client_secret: ValueType::literal("secret"),
                scopes: vec!["write".to_string()],
                params: Default::default(),
            }),
        });
        let mut r = resolved("https://backend:4317");
        r.oauth2 = Some(ResolvedOAuth2 {
            token_url: lit("https://auth/token"),
            client_id: lit("id"),
            client_secret: lit("secret"),
        });

        let parts = build_exporter("p", &out, &r, 256).unwrap();
        let (id, ext) = parts.extension.clone().unwrap();

        assert_eq!(id, "oauth2client/p");
        assert_eq!(ext.client_secret, "${OAUTH2_CLIENT_SECRET_P}");
        assert_eq!(ext.scopes, vec!["write".to_string()]);
        assert_eq!(parts.config.auth.as_ref().unwrap().authenticator, "oauth2client/p");
        assert_eq!(env_str(&parts, "OAUTH2_CLIENT_ID_P"), "id");
    }
}
