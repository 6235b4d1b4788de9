// ABOUTME: Node definitions for workflow graphs
// ABOUTME: Covers node kinds, delivery phases, retry policy and contract references

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub name: Option<String>,
    pub description: Option<String>,
    pub kind: NodeKind,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<CapabilityTag>,
    #[serde(alias = "retry")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(with = "humantime_serde", default)]
    pub timeout: Option<Duration>,
    pub phase: Option<Phase>,
    pub locks_contract: Option<String>,
    #[serde(default)]
    pub consumes_contracts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Action,
    Phase,
    Checkpoint,
    Notification,
    Interface,
}

/// Delivery phases in their fixed prerequisite order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Requirements,
    Design,
    Implementation,
    Testing,
    Deployment,
}

/// Opaque label matching a node to a capable executor. Never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityTag(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before re-entering READY after the given failed attempt (0-indexed)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = (self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32)) as u64;

        let delay = Duration::from_millis(delay_ms);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }

    pub fn exponential_backoff(max_attempts: u32, initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier: multiplier,
            max_delay: default_max_delay(),
        }
    }

    pub fn fixed_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff_multiplier: 1.0,
            max_delay: delay,
        }
    }
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            name: None,
            description: None,
            kind,
            depends_on: Vec::new(),
            capabilities: Vec::new(),
            retry_policy: None,
            timeout: None,
            phase: None,
            locks_contract: None,
            consumes_contracts: Vec::new(),
        }
    }

    pub fn action() -> Self {
        Self::new(NodeKind::Action)
    }

    pub fn interface() -> Self {
        Self::new(NodeKind::Interface)
    }

    pub fn checkpoint() -> Self {
        Self::new(NodeKind::Checkpoint)
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn in_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_capability(mut self, tag: &str) -> Self {
        self.capabilities.push(CapabilityTag(tag.to_string()));
        self
    }

    pub fn locks(mut self, contract: &str) -> Self {
        self.locks_contract = Some(contract.to_string());
        self
    }

    pub fn consumes(mut self, contract: &str) -> Self {
        self.consumes_contracts.push(contract.to_string());
        self
    }

    /// PHASE and CHECKPOINT nodes with a declared phase trigger gate evaluation
    pub fn is_boundary(&self) -> bool {
        self.kind.is_boundary() && self.phase.is_some()
    }

    pub fn is_interface(&self) -> bool {
        self.kind == NodeKind::Interface
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Action => "action",
            NodeKind::Phase => "phase",
            NodeKind::Checkpoint => "checkpoint",
            NodeKind::Notification => "notification",
            NodeKind::Interface => "interface",
        }
    }

    pub fn is_boundary(&self) -> bool {
        matches!(self, NodeKind::Phase | NodeKind::Checkpoint)
    }
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Requirements,
        Phase::Design,
        Phase::Implementation,
        Phase::Testing,
        Phase::Deployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Requirements => "requirements",
            Phase::Design => "design",
            Phase::Implementation => "implementation",
            Phase::Testing => "testing",
            Phase::Deployment => "deployment",
        }
    }

    /// Every phase that strictly precedes this one
    pub fn prerequisites(&self) -> impl Iterator<Item = Phase> + '_ {
        Phase::ALL.into_iter().filter(move |p| p < self)
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown phase '{}'", s))
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for CapabilityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
