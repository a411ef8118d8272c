//! Validation of resolved OTLP endpoints

use thiserror::Error;
use url::Url;

use crate::crd::OtlpProtocol;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("missing value")]
    Empty,

    #[error("parse '{0}': invalid characters in endpoint")]
    InvalidCharacters(String),

    #[error("parse '{endpoint}': {detail}")]
    Unparsable { endpoint: String, detail: String },

    #[error("unsupported protocol scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("missing or unsupported protocol scheme")]
    MissingScheme,

    #[error("missing host")]
    MissingHost,

    #[error("missing port")]
    MissingPort,

    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// Check a resolved endpoint against the output protocol.
///
/// GRPC endpoints may omit the scheme (`host:port`) but must carry a port.
/// HTTP endpoints must carry a scheme and may omit the port.
pub fn validate_endpoint(endpoint: &str, protocol: OtlpProtocol) -> Result<(), EndpointError> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(EndpointError::Empty);
    }
    if endpoint
        .chars()
        .any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '`')
    {
        return Err(EndpointError::InvalidCharacters(endpoint.to_string()));
    }

    let (with_scheme, had_scheme) = match endpoint.split_once("://") {
        Some(_) => (endpoint.to_string(), true),
        None if protocol == OtlpProtocol::Http => return Err(EndpointError::MissingScheme),
        None => (format!("http://{endpoint}"), false),
    };

    let url = Url::parse(&with_scheme).map_err(|e| classify_parse_error(endpoint, e))?;

    if had_scheme && !matches!(url.scheme(), "http" | "https") {
        return Err(EndpointError::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(EndpointError::MissingHost);
    }

    // Url drops default ports, so look at the authority as written
    if explicit_port(&with_scheme).is_none() && protocol == OtlpProtocol::Grpc {
        return Err(EndpointError::MissingPort);
    }

    Ok(())
}

fn classify_parse_error(endpoint: &str, err: url::ParseError) -> EndpointError {
    match err {
        url::ParseError::InvalidPort => {
            let port = explicit_port(endpoint)
                .or_else(|| endpoint.rsplit_once(':').map(|(_, p)| p.to_string()))
                .unwrap_or_default();
            EndpointError::InvalidPort(port)
        }
        url::ParseError::EmptyHost => EndpointError::MissingHost,
        other => EndpointError::Unparsable {
            endpoint: endpoint.to_string(),
            detail: other.to_string(),
        },
    }
}

/// Port as written in the authority part, if any
fn explicit_port(with_scheme: &str) -> Option<String> {
    let rest = with_scheme.split_once("://").map_or(with_scheme, |(_, r)| r);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);

    // Bracketed IPv6 literals contain colons themselves
    let after_host = match host_port.rfind(']') {
        Some(idx) => &host_port[idx + 1..],
        None => host_port,
    };
    after_host
        .rsplit_once(':')
        .map(|(_, port)| port.to_string())
        .filter(|p| !p.is_empty())
}
