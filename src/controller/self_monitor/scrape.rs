//! Scraping and rate computation for collector self-metrics
//!
//! Collectors expose their internal telemetry in the Prometheus text format.
//! Counters are turned into per-second rates by comparing two consecutive
//! scrapes of the same pod; gauges are used as read.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Timeout of a single scrape
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// Label set of one series, sorted by name
pub type Labels = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Untyped,
}

/// One sample line of an exposition
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Metric name with any `_total` suffix removed
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    pub kind: MetricKind,
}

/// Parse the Prometheus text exposition format.
///
/// `# TYPE` lines determine whether a family is a counter. Names are
/// normalized by dropping the `_total` suffix so collectors that do and do
/// not append it are read the same way.
pub fn parse_exposition(body: &str) -> Result<Vec<Sample>> {
    let mut kinds: HashMap<String, MetricKind> = HashMap::new();
    let mut samples = Vec::new();

    for (index, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            let mut parts = comment.split_whitespace();
            if parts.next() == Some("TYPE") {
                if let (Some(name), Some(kind)) = (parts.next(), parts.next()) {
                    let kind = match kind {
                        "counter" => MetricKind::Counter,
                        "gauge" => MetricKind::Gauge,
                        _ => MetricKind::Untyped,
                    };
                    kinds.insert(normalize(name).to_string(), kind);
                }
            }
            continue;
        }

        let (name, labels, rest) = parse_series(line)
            .ok_or_else(|| Error::ScrapeError(format!("malformed sample on line {}", index + 1)))?;
        let value = rest
            .split_whitespace()
            .next()
            .and_then(parse_value)
            .ok_or_else(|| Error::ScrapeError(format!("malformed value on line {}", index + 1)))?;

        let name = normalize(name).to_string();
        let kind = kinds.get(&name).copied().unwrap_or(MetricKind::Untyped);
        samples.push(Sample {
            name,
            labels,
            value,
            kind,
        });
    }

    Ok(samples)
}

fn normalize(name: &str) -> &str {
    name.strip_suffix("_total").unwrap_or(name)
}

fn parse_value(s: &str) -> Option<f64> {
    match s {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => s.parse().ok(),
    }
}

/// Split `name{a="b",c="d"} rest` into its parts
fn parse_series(line: &str) -> Option<(&str, Labels, &str)> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() {
        return None;
    }

    let rest = &line[name_end..];
    if !rest.starts_with('{') {
        return Some((name, Labels::new(), rest));
    }

    let mut labels = Labels::new();
    let mut chars = rest[1..].char_indices();
    let mut key = String::new();
    loop {
        let (i, c) = chars.next()?;
        match c {
            '}' => return Some((name, labels, &rest[i + 2..])),
            ',' | ' ' => continue,
            '=' => {
                if chars.next()?.1 != '"' {
                    return None;
                }
                let mut value = String::new();
                loop {
                    let (_, c) = chars.next()?;
                    match c {
                        '\\' => match chars.next()?.1 {
                            'n' => value.push('\n'),
                            other => value.push(other),
                        },
                        '"' => break,
                        other => value.push(other),
                    }
                }
                labels.insert(std::mem::take(&mut key), value);
            }
            other => key.push(other),
        }
    }
}

/// HTTP scraper for collector metrics endpoints
#[derive(Clone)]
pub struct Scraper {
    client: Client,
}

impl Scraper {
    pub fn new() -> Result<Self> {
        let client = Client::builder().timeout(SCRAPE_TIMEOUT).build()?;
        Ok(Self { client })
    }

    pub async fn scrape(&self, url: &str) -> Result<Vec<Sample>> {
        debug!("Scraping {}", url);
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let msg = format!("{url} returned HTTP {}", response.status());
            warn!("{}", msg);
            return Err(Error::ScrapeError(msg));
        }
        let body = response.text().await?;
        parse_exposition(&body)
    }
}

/// Current view of one pod: counter rates and gauge values
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// Per-second rates of counters; empty after the first scrape
    pub rates: Vec<Sample>,
    pub gauges: Vec<Sample>,
}

impl Snapshot {
    pub fn rates_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Sample> + 'a {
        self.rates.iter().filter(move |s| s.name == name)
    }

    pub fn gauges_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Sample> + 'a {
        self.gauges.iter().filter(move |s| s.name == name)
    }
}

type SeriesKey = (String, Labels);

/// Rate history key of one pod of a workload
pub fn pod_key(component: &str, pod: &str) -> String {
    format!("{component}/{pod}")
}

pub fn is_component_key(key: &str, component: &str) -> bool {
    key.strip_prefix(component)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Remembers the previous scrape of each pod to derive counter rates.
///
/// Replicas behind one Service report independent counters, so history is
/// never shared between pods.
#[derive(Default)]
pub struct RateTracker {
    previous: HashMap<String, (Instant, HashMap<SeriesKey, f64>)>,
}

impl RateTracker {
    pub fn observe(&mut self, key: &str, samples: Vec<Sample>, now: Instant) -> Snapshot {
        let mut snapshot = Snapshot::default();
        let mut counters = HashMap::new();
        let previous = self.previous.get(key);

        for sample in samples {
            match sample.kind {
                MetricKind::Counter => {
                    let key = (sample.name.clone(), sample.labels.clone());
                    if let Some((at, before)) = previous {
                        let elapsed = now.saturating_duration_since(*at).as_secs_f64();
                        if let (Some(old), true) = (before.get(&key), elapsed > 0.0) {
                            // a drop means the collector restarted and the counter reset
                            let delta = if sample.value >= *old {
                                sample.value - old
                            } else {
                                sample.value
                            };
                            snapshot.rates.push(Sample {
                                value: delta / elapsed,
                                ..sample.clone()
                            });
                        }
                    }
                    counters.insert(key, sample.value);
                }
                MetricKind::Gauge | MetricKind::Untyped => snapshot.gauges.push(sample),
            }
        }

        self.previous.insert(key.to_string(), (now, counters));
        snapshot
    }

    /// Drop the history of one pod
    pub fn forget(&mut self, key: &str) {
        self.previous.remove(key);
    }

    /// Drop the history of every pod of a workload
    pub fn forget_component(&mut self, component: &str) {
        self.retain(|key| !is_component_key(key, component));
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.previous.retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}
