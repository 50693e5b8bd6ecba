//! Stream executor configuration.
//!
//! The key/value surface is validated eagerly: unknown keys and malformed
//! values fail with `CoreError::Config` and leave the previous configuration
//! untouched.

use crate::error::{CoreError, Result};
use crate::topology::{CoreTopology, HybridLayout};

/// How worker threads are bound to hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadBindingPolicy {
    /// No binding; threads float freely.
    #[default]
    None,
    /// Pin each stream's threads to computed core offsets.
    Cores,
    /// Bind each stream to its assigned NUMA node's CPU mask.
    NumaNode,
    /// Pin to cores and honor performance/efficiency core classes.
    HybridAware,
}

/// Core-class preference under `HybridAware` binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoreClassPreference {
    /// No preference; any core class.
    #[default]
    Any,
    /// Performance cores only.
    Performance,
    /// Efficiency cores only.
    Efficiency,
    /// Alternate across classes, weighted by each class's concurrency.
    RoundRobin,
}

/// OS scheduling priority applied to worker threads. Best-effort: a failed
/// priority call is logged and the stream continues at default priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityTier {
    Lowest,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

impl PriorityTier {
    /// Unix nice value for this tier (lower = higher priority).
    pub(crate) fn nice_value(self) -> i32 {
        match self {
            Self::Lowest => 19,
            Self::BelowNormal => 10,
            Self::Normal => 0,
            Self::AboveNormal => -5,
            Self::Highest => -10,
        }
    }
}

/// Supported configuration keys.
pub const KEY_STREAMS: &str = "streams";
pub const KEY_THREAD_BINDING: &str = "thread-binding";
pub const KEY_THREADS_PER_STREAM: &str = "threads-per-stream";

/// Immutable-once-constructed configuration of a [`StreamExecutor`].
///
/// [`StreamExecutor`]: super::StreamExecutor
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Executor name; used as the worker thread name prefix.
    pub name: String,
    /// Number of worker threads (streams). 0 = inline mode, no pool.
    pub streams: usize,
    /// Threads budgeted per stream; spaces pin offsets. 0 = runtime default.
    pub threads_per_stream: usize,
    pub binding: ThreadBindingPolicy,
    /// Added to every computed pin offset.
    pub binding_offset: usize,
    /// Stride between consecutive pinned cores. 0 = dense (step 1).
    pub binding_step: usize,
    pub preferred_core_class: CoreClassPreference,
    pub priority: PriorityTier,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "stream".to_string(),
            streams: 0,
            threads_per_stream: 0,
            binding: ThreadBindingPolicy::None,
            binding_offset: 0,
            binding_step: 0,
            preferred_core_class: CoreClassPreference::Any,
            priority: PriorityTier::Normal,
        }
    }
}

impl StreamConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Keys accepted by [`set`](Self::set).
    pub fn supported_keys() -> Vec<&'static str> {
        vec![KEY_STREAMS, KEY_THREAD_BINDING, KEY_THREADS_PER_STREAM]
    }

    /// Apply one string key/value pair.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            KEY_STREAMS => {
                self.streams = parse_count(key, value)?;
            }
            KEY_THREADS_PER_STREAM => {
                self.threads_per_stream = parse_count(key, value)?;
            }
            KEY_THREAD_BINDING => {
                self.binding = match value {
                    "none" => ThreadBindingPolicy::None,
                    "cores" => ThreadBindingPolicy::Cores,
                    "numa" => ThreadBindingPolicy::NumaNode,
                    "hybrid-aware" => ThreadBindingPolicy::HybridAware,
                    other => {
                        return Err(CoreError::Config(format!(
                            "invalid value '{other}' for key '{key}': expected \
                             none | cores | numa | hybrid-aware"
                        )))
                    }
                };
            }
            other => {
                return Err(CoreError::Config(format!("unknown config key '{other}'")))
            }
        }
        Ok(())
    }

    /// Read one key back as a string.
    pub fn get(&self, key: &str) -> Result<String> {
        match key {
            KEY_STREAMS => Ok(self.streams.to_string()),
            KEY_THREADS_PER_STREAM => Ok(self.threads_per_stream.to_string()),
            KEY_THREAD_BINDING => Ok(match self.binding {
                ThreadBindingPolicy::None => "none",
                ThreadBindingPolicy::Cores => "cores",
                ThreadBindingPolicy::NumaNode => "numa",
                ThreadBindingPolicy::HybridAware => "hybrid-aware",
            }
            .to_string()),
            other => Err(CoreError::Config(format!("unknown config key '{other}'"))),
        }
    }

    /// Fill in runtime defaults from the host topology.
    ///
    /// `threads_per_stream == 0` becomes cores-per-stream; under
    /// `HybridAware` binding with `Any` preference the core-class choice is
    /// derived from the performance/efficiency ratio: the latency case
    /// (streams fit within the NUMA node count) prefers performance cores
    /// when they dominate, while the throughput case round-robins across
    /// classes weighted by their concurrency.
    pub fn default_multi_threaded(mut self, topology: &CoreTopology, fp_intensive: bool) -> Self {
        let latency_case = self.streams <= topology.numa_nodes().len();
        let mut available = topology.physical_cores();

        if self.binding == ThreadBindingPolicy::HybridAware {
            if let Some(hybrid) = topology.hybrid() {
                // Relative efficiency of performance vs efficiency cores for
                // fp32-heavy vs int8-heavy code.
                let threshold = if fp_intensive { 2 } else { 4 };
                let big_only =
                    hybrid.performance_cores > hybrid.efficiency_cores / threshold;
                if self.preferred_core_class == CoreClassPreference::Any {
                    self.preferred_core_class = if latency_case {
                        if big_only {
                            CoreClassPreference::Performance
                        } else {
                            CoreClassPreference::Any
                        }
                    } else {
                        CoreClassPreference::RoundRobin
                    };
                }
                if latency_case && big_only {
                    available = hybrid.performance_cores;
                }
            }
        } else if !latency_case && topology.numa_nodes().len() == 1 {
            // Throughput case on a single node benefits from hyper-threads.
            available = topology.logical_cpus();
        }

        if self.threads_per_stream == 0 {
            self.threads_per_stream = if self.streams == 0 {
                available
            } else {
                (available / self.streams).max(1)
            };
        }
        self
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|_| {
        CoreError::Config(format!(
            "invalid value '{value}' for key '{key}': expected a non-negative integer"
        ))
    })
}
