//! Data model for the coordination engine: resource addresses and
//! footprints, complexity factors, and the task records that flow
//! through planning and execution.

use crate::core::errors::{FanoutError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Reserved bucket for tasks whose footprint is not known in advance.
/// Everything in it is resolved sequentially.
pub const UNKNOWN_SHARED_BUCKET: &str = "unknown-shared";

/// A unique, path-like identifier for an output unit (e.g. one document slot).
///
/// Normalized form: `/`-separated segments, no leading/trailing slash,
/// no empty segments, no wildcard characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress(String);

impl ResourceAddress {
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(FanoutError::validation_field(
                "resource address cannot be empty",
                "resource_footprint",
            ));
        }
        if trimmed.contains('*') {
            return Err(FanoutError::validation_field(
                format!("resource address '{raw}' may not contain wildcards"),
                "resource_footprint",
            ));
        }
        if trimmed.split('/').any(|seg| seg.trim().is_empty()) {
            return Err(FanoutError::validation_field(
                format!("resource address '{raw}' contains an empty segment"),
                "resource_footprint",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = FanoutError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<ResourceAddress> for String {
    fn from(value: ResourceAddress) -> Self {
        value.0
    }
}

/// One element of a declared footprint: either an exact address or a
/// glob-like prefix such as `module/auth/*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourcePattern {
    Exact(ResourceAddress),
    Prefix(String),
}

impl ResourcePattern {
    /// Parse a raw footprint element. `a/b/*` becomes a prefix pattern;
    /// a bare `*` is the match-all prefix (well-formed, but never
    /// isolatable by the ownership assigner).
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FanoutError::validation_field(
                "footprint pattern cannot be empty",
                "resource_footprint",
            ));
        }
        if trimmed == "*" || trimmed == "**" {
            return Ok(Self::Prefix(String::new()));
        }
        if let Some(stem) = trimmed.strip_suffix("/*").or_else(|| trimmed.strip_suffix("/**")) {
            let addr = ResourceAddress::new(stem)?;
            return Ok(Self::Prefix(addr.0));
        }
        Ok(Self::Exact(ResourceAddress::new(trimmed)?))
    }

    /// The prefix that matches every address
    pub fn is_match_all(&self) -> bool {
        matches!(self, Self::Prefix(p) if p.is_empty())
    }

    /// Does this pattern cover the given address?
    pub fn matches(&self, addr: &ResourceAddress) -> bool {
        match self {
            Self::Exact(a) => a == addr,
            Self::Prefix(p) => {
                p.is_empty()
                    || addr.0 == *p
                    || (addr.0.starts_with(p) && addr.0.as_bytes().get(p.len()) == Some(&b'/'))
            }
        }
    }

    /// Do two patterns cover at least one common address?
    pub fn intersects(&self, other: &ResourcePattern) -> bool {
        match (self, other) {
            (Self::Exact(a), Self::Exact(b)) => a == b,
            (Self::Exact(a), Self::Prefix(_)) => other.matches(a),
            (Self::Prefix(_), Self::Exact(b)) => self.matches(b),
            (Self::Prefix(a), Self::Prefix(b)) => {
                a.is_empty()
                    || b.is_empty()
                    || prefix_covers(a, b)
                    || prefix_covers(b, a)
            }
        }
    }

    /// Of two intersecting patterns, the one covering the smaller set.
    /// Used as the canonical key for a shared resource.
    pub fn narrower<'a>(&'a self, other: &'a ResourcePattern) -> &'a ResourcePattern {
        match (self, other) {
            (Self::Exact(_), _) => self,
            (_, Self::Exact(_)) => other,
            (Self::Prefix(a), Self::Prefix(b)) => {
                if a.len() >= b.len() {
                    self
                } else {
                    other
                }
            }
        }
    }

    /// The address a sequential resolution is keyed by: the exact address,
    /// or the prefix stem for prefix patterns.
    pub fn canonical_address(&self) -> ResourceAddress {
        match self {
            Self::Exact(a) => a.clone(),
            Self::Prefix(p) if p.is_empty() => ResourceAddress(UNKNOWN_SHARED_BUCKET.to_string()),
            Self::Prefix(p) => ResourceAddress(p.clone()),
        }
    }
}

fn prefix_covers(outer: &str, inner: &str) -> bool {
    inner == outer || (inner.starts_with(outer) && inner.as_bytes().get(outer.len()) == Some(&b'/'))
}

impl fmt::Display for ResourcePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(a) => f.write_str(a.as_str()),
            Self::Prefix(p) if p.is_empty() => f.write_str("*"),
            Self::Prefix(p) => write!(f, "{p}/*"),
        }
    }
}

impl TryFrom<String> for ResourcePattern {
    type Error = FanoutError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourcePattern> for String {
    fn from(value: ResourcePattern) -> Self {
        value.to_string()
    }
}

/// The set of resources a task will write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Footprint {
    Declared(Vec<ResourcePattern>),
    /// Not knowable in advance; routed to the unknown-shared bucket
    Unknown,
}

impl Footprint {
    /// Parse the external footprint field. `None` means unknown;
    /// an empty declared list is malformed.
    pub fn parse(raw: Option<&[String]>) -> Result<Self> {
        match raw {
            None => Ok(Self::Unknown),
            Some(items) if items.is_empty() => Err(FanoutError::validation_field(
                "declared resource footprint cannot be empty",
                "resource_footprint",
            )),
            Some(items) => {
                let mut seen = HashSet::new();
                let mut patterns = Vec::with_capacity(items.len());
                for item in items {
                    let pattern = ResourcePattern::parse(item)?;
                    if seen.insert(pattern.clone()) {
                        patterns.push(pattern);
                    }
                }
                Ok(Self::Declared(patterns))
            }
        }
    }

    pub fn patterns(&self) -> &[ResourcePattern] {
        match self {
            Self::Declared(p) => p,
            Self::Unknown => &[],
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Resource count used by the budget multiplier chain
    pub fn resource_count(&self) -> usize {
        match self {
            Self::Declared(p) => p.len(),
            Self::Unknown => 1,
        }
    }

    /// Pairs of intersecting patterns between two declared footprints
    pub fn intersections<'a>(
        &'a self,
        other: &'a Footprint,
    ) -> Vec<(&'a ResourcePattern, &'a ResourcePattern)> {
        let mut out = Vec::new();
        for a in self.patterns() {
            for b in other.patterns() {
                if a.intersects(b) {
                    out.push((a, b));
                }
            }
        }
        out
    }
}

/// Requested research/output depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Minimal,
    #[default]
    Standard,
    Thorough,
}

impl Depth {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Minimal => 0.5,
            Self::Standard => 1.0,
            Self::Thorough => 2.0,
        }
    }
}

/// Task complexity class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Standard,
    Complex,
}

impl Complexity {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Simple => 0.8,
            Self::Standard => 1.0,
            Self::Complex => 1.5,
        }
    }
}

/// Task priority level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Low => 0.7,
            Self::Medium => 1.0,
            Self::High => 1.3,
            Self::Critical => 1.5,
        }
    }
}

/// External batch-input record for one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub description: String,
    /// `None` means the footprint is unknown in advance
    #[serde(default)]
    pub resource_footprint: Option<Vec<String>>,
    #[serde(default)]
    pub depth: Depth,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default)]
    pub priority: Priority,
    /// Ids of tasks that must complete before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Validated task. Immutable once assigned to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub footprint: Footprint,
    pub depth: Depth,
    pub complexity: Complexity,
    pub priority: Priority,
    pub dependencies: Vec<String>,
    /// Position in the original batch; drives sequential-phase ordering
    pub submission_index: usize,
}

impl Task {
    pub fn from_spec(spec: &TaskSpec, submission_index: usize) -> Result<Self> {
        if spec.id.trim().is_empty() {
            return Err(FanoutError::validation_field("task id cannot be empty", "id"));
        }
        if spec.dependencies.iter().any(|d| d == &spec.id) {
            return Err(FanoutError::validation_field(
                format!("task '{}' depends on itself", spec.id),
                "dependencies",
            ));
        }
        let footprint = Footprint::parse(spec.resource_footprint.as_deref())?;
        Ok(Self {
            id: spec.id.clone(),
            description: spec.description.clone(),
            footprint,
            depth: spec.depth,
            complexity: spec.complexity,
            priority: spec.priority,
            dependencies: spec.dependencies.clone(),
            submission_index,
        })
    }
}

/// Validate a whole batch: per-task checks plus cross-task id integrity.
/// Rejection here means no task from the batch enters execution.
pub fn validate_batch(specs: &[TaskSpec]) -> Result<Vec<Task>> {
    let mut ids = HashSet::new();
    for spec in specs {
        if !ids.insert(spec.id.as_str()) {
            return Err(FanoutError::validation_field(
                format!("duplicate task id '{}'", spec.id),
                "id",
            ));
        }
    }
    let mut tasks = Vec::with_capacity(specs.len());
    for (index, spec) in specs.iter().enumerate() {
        for dep in &spec.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(FanoutError::validation_field(
                    format!("task '{}' depends on unknown task '{dep}'", spec.id),
                    "dependencies",
                ));
            }
        }
        tasks.push(Task::from_spec(spec, index)?);
    }
    Ok(tasks)
}

/// Why a task ended as partially complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialReason {
    Timeout,
    Stuck,
    BudgetExceeded,
    Cancelled,
}

/// Final per-task result surfaced in the session report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    Partial { reason: PartialReason },
    Failed { reason: String },
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}
