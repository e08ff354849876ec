//! Task resource requests and retry-time scaling.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Default multiplier applied when a scaling factor is missing or invalid.
pub const DEFAULT_SCALING_FACTOR: f64 = 1.5;

// ============================================================================
// Resource Requests
// ============================================================================

/// Resources requested for one task instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResources {
    pub memory_mib: u64,
    pub runtime_seconds: u64,
    pub cores: u32,
    #[serde(default)]
    pub queue: Option<String>,
}

impl Default for TaskResources {
    fn default() -> Self {
        Self {
            memory_mib: 1024,
            runtime_seconds: 3600,
            cores: 1,
            queue: None,
        }
    }
}

impl TaskResources {
    pub fn with_memory_mib(memory_mib: u64) -> Self {
        Self {
            memory_mib,
            ..Self::default()
        }
    }

    /// Per-field maximum of two requests. Used to keep scaled requests from
    /// ever dropping below the original ask.
    pub fn max_with(&self, floor: &TaskResources) -> TaskResources {
        TaskResources {
            memory_mib: self.memory_mib.max(floor.memory_mib),
            runtime_seconds: self.runtime_seconds.max(floor.runtime_seconds),
            cores: self.cores.max(floor.cores),
            queue: self.queue.clone().or_else(|| floor.queue.clone()),
        }
    }
}

// ============================================================================
// Cluster Limits
// ============================================================================

/// Per-field maxima advertised by the cluster back-end. `None` means the
/// back-end imposes no cap on that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterLimits {
    pub max_memory_mib: Option<u64>,
    pub max_runtime_seconds: Option<u64>,
    pub max_cores: Option<u32>,
}

impl ClusterLimits {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn clamp(&self, request: TaskResources) -> TaskResources {
        TaskResources {
            memory_mib: match self.max_memory_mib {
                Some(max) => request.memory_mib.min(max),
                None => request.memory_mib,
            },
            runtime_seconds: match self.max_runtime_seconds {
                Some(max) => request.runtime_seconds.min(max),
                None => request.runtime_seconds,
            },
            cores: match self.max_cores {
                Some(max) => request.cores.min(max),
                None => request.cores,
            },
            queue: request.queue,
        }
    }
}

// ============================================================================
// Scaling Policy
// ============================================================================

/// Callback form of a scaling policy. Receives the original request and the
/// upcoming attempt number (1-based) and returns the new request.
pub type ResourceScaler =
    Arc<dyn Fn(&TaskResources, u32) -> TaskResources + Send + Sync>;

/// How a task's resource request grows across retries caused by resource
/// errors.
#[derive(Clone, Default)]
pub enum ResourceScalingPolicy {
    /// Request the original resources on every attempt.
    #[default]
    Constant,
    /// Multiply memory and runtime by `factor` once per completed retry:
    /// request = original * factor^(attempt - 1).
    LinearFactor { factor: f64 },
    /// Caller-supplied scaling function.
    Custom { scaler: ResourceScaler },
}

impl ResourceScalingPolicy {
    /// Linear-factor policy with an invalid factor falling back to
    /// [`DEFAULT_SCALING_FACTOR`].
    pub fn linear(factor: f64) -> Self {
        let factor = if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            DEFAULT_SCALING_FACTOR
        };
        Self::LinearFactor { factor }
    }

    pub fn custom(scaler: ResourceScaler) -> Self {
        Self::Custom { scaler }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::LinearFactor { .. } => "linear_factor",
            Self::Custom { .. } => "custom",
        }
    }

    /// Request for the given attempt (1-based), clamped to the cluster limits
    /// and floored at the original request.
    pub fn request_for_attempt(
        &self,
        original: &TaskResources,
        attempt: u32,
        limits: &ClusterLimits,
    ) -> TaskResources {
        let scaled = match self {
            Self::Constant => original.clone(),
            Self::LinearFactor { factor } => {
                if attempt <= 1 {
                    original.clone()
                } else {
                    let growth = factor.powi(attempt as i32 - 1);
                    TaskResources {
                        memory_mib: scale_u64(original.memory_mib, growth),
                        runtime_seconds: scale_u64(original.runtime_seconds, growth),
                        cores: original.cores,
                        queue: original.queue.clone(),
                    }
                }
            }
            Self::Custom { scaler } => scaler(original, attempt),
        };
        // Floor at the original ask first; the cluster cap wins over the floor.
        limits.clamp(scaled.max_with(original))
    }
}

fn scale_u64(value: u64, growth: f64) -> u64 {
    let scaled = (value as f64 * growth).round();
    if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    }
}

impl std::fmt::Debug for ResourceScalingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant => write!(f, "Constant"),
            Self::LinearFactor { factor } => {
                f.debug_struct("LinearFactor").field("factor", factor).finish()
            }
            Self::Custom { .. } => write!(f, "Custom"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_policy_never_changes_the_request() {
        let original = TaskResources::with_memory_mib(2048);
        let policy = ResourceScalingPolicy::Constant;
        let limits = ClusterLimits::unbounded();
        for attempt in 1..=5 {
            assert_eq!(
                policy.request_for_attempt(&original, attempt, &limits),
                original
            );
        }
    }

    #[test]
    fn linear_factor_compounds_per_retry() {
        let original = TaskResources::with_memory_mib(1024);
        let policy = ResourceScalingPolicy::linear(1.5);
        let limits = ClusterLimits::unbounded();

        let first = policy.request_for_attempt(&original, 1, &limits);
        assert_eq!(first.memory_mib, 1024);

        let second = policy.request_for_attempt(&original, 2, &limits);
        assert_eq!(second.memory_mib, 1536);

        let third = policy.request_for_attempt(&original, 3, &limits);
        assert_eq!(third.memory_mib, 2304);
    }

    #[test]
    fn linear_factor_scales_runtime_but_not_cores() {
        let original = TaskResources {
            memory_mib: 100,
            runtime_seconds: 1000,
            cores: 4,
            queue: Some("long".to_string()),
        };
        let policy = ResourceScalingPolicy::linear(2.0);
        let limits = ClusterLimits::unbounded();
        let second = policy.request_for_attempt(&original, 2, &limits);
        assert_eq!(second.memory_mib, 200);
        assert_eq!(second.runtime_seconds, 2000);
        assert_eq!(second.cores, 4);
        assert_eq!(second.queue.as_deref(), Some("long"));
    }

    #[test]
    fn invalid_factor_falls_back_to_default() {
        for bad in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let policy = ResourceScalingPolicy::linear(bad);
            match policy {
                ResourceScalingPolicy::LinearFactor { factor } => {
                    assert!((factor - DEFAULT_SCALING_FACTOR).abs() < f64::EPSILON);
                }
                other => panic!("unexpected policy: {other:?}"),
            }
        }
    }

    #[test]
    fn scaled_request_is_clamped_to_cluster_limits() {
        let original = TaskResources::with_memory_mib(1024);
        let policy = ResourceScalingPolicy::linear(10.0);
        let limits = ClusterLimits {
            max_memory_mib: Some(4096),
            max_runtime_seconds: None,
            max_cores: None,
        };
        let scaled = policy.request_for_attempt(&original, 3, &limits);
        assert_eq!(scaled.memory_mib, 4096);
    }

    #[test]
    fn custom_scaler_cannot_drop_below_original() {
        let original = TaskResources::with_memory_mib(1024);
        let policy = ResourceScalingPolicy::custom(Arc::new(|_, _| {
            TaskResources::with_memory_mib(1)
        }));
        let limits = ClusterLimits::unbounded();
        let scaled = policy.request_for_attempt(&original, 2, &limits);
        assert_eq!(scaled.memory_mib, 1024);
    }

    #[test]
    fn custom_scaler_receives_attempt_number() {
        let original = TaskResources::with_memory_mib(100);
        let policy = ResourceScalingPolicy::custom(Arc::new(|base, attempt| {
            TaskResources::with_memory_mib(base.memory_mib + u64::from(attempt) * 100)
        }));
        let limits = ClusterLimits::unbounded();
        assert_eq!(
            policy.request_for_attempt(&original, 3, &limits).memory_mib,
            400
        );
    }

    #[test]
    fn kind_str_names_each_policy() {
        assert_eq!(ResourceScalingPolicy::Constant.kind_str(), "constant");
        assert_eq!(ResourceScalingPolicy::linear(2.0).kind_str(), "linear_factor");
        assert_eq!(
            ResourceScalingPolicy::custom(Arc::new(|r, _| r.clone())).kind_str(),
            "custom"
        );
    }

    #[test]
    fn clamp_applies_per_field() {
        let limits = ClusterLimits {
            max_memory_mib: Some(512),
            max_runtime_seconds: Some(60),
            max_cores: Some(2),
        };
        let clamped = limits.clamp(TaskResources {
            memory_mib: 1024,
            runtime_seconds: 30,
            cores: 8,
            queue: None,
        });
        assert_eq!(clamped.memory_mib, 512);
        assert_eq!(clamped.runtime_seconds, 30);
        assert_eq!(clamped.cores, 2);
    }
}
