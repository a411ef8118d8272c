//! Classification of pipelines into usable and unusable
//!
//! Every pass re-evaluates all pipelines of a signal from scratch. The first
//! failing check decides the reason, in this order: admission rules, the
//! pipeline limit, secret references, TLS material, the endpoint, and the
//! transform/filter statements.

use std::collections::BTreeSet;

use tracing::{debug, instrument};

use super::conditions::*;
use super::config::{Synthesizer, UsablePipeline};
use super::endpoint::validate_endpoint;
use super::pipeline::PipelineView;
use super::secret_ref::{ReferenceError, ReferenceResolver, ResolvedOutput, SecretReader};
use super::tls_cert::{TlsCertError, TlsCertStatus, TlsCertValidator, TlsMaterial};

/// Default number of usable pipelines per signal
pub const DEFAULT_MAX_PIPELINES: usize = 5;

/// Why a pipeline is (or is almost) unusable
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finding {
    pub reason: &'static str,
    pub message: String,
}

impl Finding {
    pub(crate) fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Verdict {
    /// Contributes to synthesis; `warning` is surfaced without blocking
    Usable {
        resolved: ResolvedOutput,
        warning: Option<Finding>,
    },
    Unusable(Finding),
    /// Being deleted, takes no part in the pass
    Deleting,
}

impl Verdict {
    pub fn is_usable(&self) -> bool {
        matches!(self, Verdict::Usable { .. })
    }
}

#[derive(Clone, Debug)]
pub struct Classification {
    pub view: PipelineView,
    pub verdict: Verdict,
}

impl Classification {
    /// The finding to report on `ConfigurationGenerated`, if any
    pub fn finding(&self) -> Option<&Finding> {
        match &self.verdict {
            Verdict::Usable { warning, .. } => warning.as_ref(),
            Verdict::Unusable(finding) => Some(finding),
            Verdict::Deleting => None,
        }
    }
}

/// Names of the pipelines within the limit, oldest first.
///
/// Pipelines are ordered by creation time, ties broken by name. Pipelines
/// being deleted do not take a slot.
pub fn rank(views: &[PipelineView], max: usize) -> BTreeSet<String> {
    let mut live: Vec<&PipelineView> = views.iter().filter(|v| !v.deleting).collect();
    live.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.name.cmp(&b.name)));
    live.into_iter().take(max).map(|v| v.name.clone()).collect()
}

pub struct PipelineValidator<'a, R> {
    pub resolver: &'a ReferenceResolver<R>,
    pub tls: &'a TlsCertValidator,
    pub synthesizer: &'a dyn Synthesizer,
    pub max_pipelines: usize,
}

impl<'a, R: SecretReader> PipelineValidator<'a, R> {
    /// Classify every pipeline of one signal
    #[instrument(skip_all, fields(signal = %self.synthesizer.signal(), count = views.len()))]
    pub async fn classify(&self, views: Vec<PipelineView>) -> Vec<Classification> {
        let eligible = rank(&views, self.max_pipelines);
        let mut out = Vec::with_capacity(views.len());
        for view in views {
            let verdict = self.classify_one(&view, &eligible).await;
            debug!(
                "Pipeline {} classified: usable={} reason={:?}",
                view.name,
                verdict.is_usable(),
                match &verdict {
                    Verdict::Unusable(f) => Some(f.reason),
                    _ => None,
                }
            );
            out.push(Classification { view, verdict });
        }
        out
    }

    async fn classify_one(&self, view: &PipelineView, eligible: &BTreeSet<String>) -> Verdict {
        if view.deleting {
            return Verdict::Deleting;
        }

        if !view.admission_errors().is_empty() {
            let errors: Vec<String> = view.admission_errors().iter().map(|e| e.to_string()).collect();
            return Verdict::Unusable(Finding::new(
                REASON_VALIDATION_FAILED,
                format!("Pipeline specification is invalid: {}", errors.join("; ")),
            ));
        }

        if !eligible.contains(&view.name) {
            return Verdict::Unusable(Finding::new(
                REASON_MAX_PIPELINES_EXCEEDED,
                format!(
                    "Maximum pipeline count limit of {} exceeded",
                    self.max_pipelines
                ),
            ));
        }

        let resolved = match self.resolver.resolve_output(&view.output).await {
            Ok(resolved) => resolved,
            Err(e) => return Verdict::Unusable(reference_finding(&e)),
        };

        let mut warning = None;
        if let Some(tls) = &resolved.tls {
            let material = TlsMaterial {
                ca: tls.ca.as_ref().map(|r| r.value.clone()),
                cert: tls.cert.as_ref().map(|r| r.value.clone()),
                key: tls.key.as_ref().map(|r| r.value.clone()),
            };
            if let Err(e) = self.tls.validate(&material) {
                let finding = tls_finding(&e);
                if e.is_warning() {
                    warning = Some(finding);
                } else {
                    return Verdict::Unusable(finding);
                }
            }
        }

        if let Err(e) = validate_endpoint(&resolved.endpoint.value, view.output.protocol) {
            return Verdict::Unusable(Finding::new(
                REASON_ENDPOINT_INVALID,
                format!("OTLP output endpoint invalid: {e}"),
            ));
        }

        if let Err(e) = self.synthesizer.validate(view) {
            return Verdict::Unusable(Finding::new(
                REASON_OTTL_SPEC_INVALID,
                format!("Invalid transform or filter specification: {e}"),
            ));
        }

        Verdict::Usable { resolved, warning }
    }
}

pub(crate) fn reference_finding(e: &ReferenceError) -> Finding {
    if let ReferenceError::NotUtf8 { .. } = e {
        return Finding::new(
            REASON_VALIDATION_FAILED,
            format!("Pipeline validation failed: {e}"),
        );
    }
    if e.is_transient() {
        Finding::new(
            REASON_VALIDATION_FAILED,
            format!("Pipeline validation failed due to an error from the Kubernetes API server: {e}"),
        )
    } else {
        Finding::new(
            REASON_REFERENCED_SECRET_MISSING,
            format!("One or more referenced Secrets are missing: {e}"),
        )
    }
}

pub(crate) fn tls_finding(e: &TlsCertError) -> Finding {
    match e.status() {
        TlsCertStatus::Expired => Finding::new(REASON_TLS_CERTIFICATE_EXPIRED, e.to_string()),
        TlsCertStatus::AboutToExpire => {
            Finding::new(REASON_TLS_CERTIFICATE_ABOUT_TO_EXPIRE, e.to_string())
        }
        TlsCertStatus::Invalid | TlsCertStatus::Valid => Finding::new(
            REASON_TLS_CONFIGURATION_INVALID,
            format!("TLS configuration invalid: {e}"),
        ),
    }
}

/// Split a classification into the input of the synthesizer
pub fn usable(classified: &[Classification]) -> Vec<UsablePipeline> {
    classified
        .iter()
        .filter_map(|c| match &c.verdict {
            Verdict::Usable { resolved, .. } => Some(UsablePipeline {
                view: c.view.clone(),
                resolved: resolved.clone(),
            }),
            _ => None,
        })
        .collect()
}
