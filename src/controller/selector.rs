//! Match predicates for namespace, container and label selection
//!
//! Selectors from the pipeline spec are turned into these value objects
//! once. Evaluation (`matches`) and rendering into collector expressions
//! both go through the same object so the two never disagree.

use std::collections::BTreeMap;

use crate::crd::{ContainerSelector, NamespaceSelector, PodLabel};

use super::config::ottl;

/// Namespaces that only run platform components
pub const SYSTEM_NAMESPACES: &[&str] = &[
    "kube-system",
    "kube-public",
    "kube-node-lease",
    "istio-system",
    "kyma-system",
];

/// Include/exclude predicate over a set of names
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameMatcher {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl NameMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Self {
        let mut include = include.to_vec();
        let mut exclude = exclude.to_vec();
        include.sort();
        include.dedup();
        exclude.sort();
        exclude.dedup();
        Self { include, exclude }
    }

    /// Matches everything
    pub fn any() -> Self {
        Self::default()
    }

    pub fn matches(&self, name: &str) -> bool {
        if !self.include.is_empty() {
            return self.include.iter().any(|n| n == name);
        }
        !self.exclude.iter().any(|n| n == name)
    }

    /// True when the predicate lets everything through
    pub fn is_unrestricted(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// Render as a drop condition over `attribute`: true for records that
    /// must NOT pass. Records without the attribute are kept.
    pub fn drop_condition(&self, attribute: &str) -> Option<String> {
        if !self.include.is_empty() {
            let any_included = ottl::join_with_or(
                self.include
                    .iter()
                    .map(|n| ottl::resource_attribute_equals(attribute, n)),
            );
            return Some(ottl::join_with_and([
                ottl::resource_attribute_is_not_nil(attribute),
                ottl::not(&any_included),
            ]));
        }
        if !self.exclude.is_empty() {
            return Some(ottl::join_with_or(
                self.exclude
                    .iter()
                    .map(|n| ottl::resource_attribute_equals(attribute, n)),
            ));
        }
        None
    }
}

impl From<&NamespaceSelector> for NameMatcher {
    fn from(selector: &NamespaceSelector) -> Self {
        NameMatcher::new(&selector.include, &selector.exclude)
    }
}

impl From<&ContainerSelector> for NameMatcher {
    fn from(selector: &ContainerSelector) -> Self {
        NameMatcher::new(&selector.include, &selector.exclude)
    }
}

/// Namespace predicate with the system-namespace default applied.
///
/// Without an explicit selector, system namespaces are excluded unless
/// `include_system` is set.
pub fn namespace_matcher(selector: Option<&NamespaceSelector>, include_system: bool) -> NameMatcher {
    match selector {
        Some(s) if !s.include.is_empty() || !s.exclude.is_empty() => NameMatcher::from(s),
        _ if include_system => NameMatcher::any(),
        _ => NameMatcher::new(
            &[],
            &SYSTEM_NAMESPACES
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
        ),
    }
}

/// Label key predicate of the enrichment allow-list
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyMatcher {
    Exact(String),
    Prefix(String),
}

impl KeyMatcher {
    pub fn from_pod_label(label: &PodLabel) -> Option<Self> {
        match (
            label.key.as_deref().filter(|k| !k.is_empty()),
            label.key_prefix.as_deref().filter(|k| !k.is_empty()),
        ) {
            (Some(key), None) => Some(KeyMatcher::Exact(key.to_string())),
            (None, Some(prefix)) => Some(KeyMatcher::Prefix(prefix.to_string())),
            _ => None,
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::Exact(k) => key == k,
            KeyMatcher::Prefix(p) => key.starts_with(p.as_str()),
        }
    }

    /// Regular expression understood by the collector's attribute extraction
    pub fn key_regex(&self) -> String {
        match self {
            KeyMatcher::Exact(k) => format!("(^{}$)", regex::escape(k)),
            KeyMatcher::Prefix(p) => format!("({}.*)", regex::escape(p)),
        }
    }
}

/// Ordered allow-list of label keys
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelAllowList(Vec<KeyMatcher>);

impl LabelAllowList {
    pub fn new(labels: &[PodLabel]) -> Self {
        Self(labels.iter().filter_map(KeyMatcher::from_pod_label).collect())
    }

    pub fn matchers(&self) -> &[KeyMatcher] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Labels that pass the allow-list
    pub fn select<'a>(&self, labels: &'a BTreeMap<String, String>) -> BTreeMap<&'a str, &'a str> {
        labels
            .iter()
            .filter(|(k, _)| self.0.iter().any(|m| m.matches(k)))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}
