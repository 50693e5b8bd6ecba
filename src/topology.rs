//! Host CPU layout queries: sockets/NUMA nodes, core counts, and
//! heterogeneous (performance/efficiency) core classes.
//!
//! Pure query surface; detection runs once and the result is immutable.

/// Class of a core on a hybrid (heterogeneous) CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreClass {
    Performance,
    Efficiency,
}

/// Core-class counts on a hybrid CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridLayout {
    /// Number of logical performance cores.
    pub performance_cores: usize,
    /// Number of logical efficiency cores.
    pub efficiency_cores: usize,
}

impl HybridLayout {
    /// Native concurrency of one class.
    pub fn concurrency(&self, class: CoreClass) -> usize {
        match class {
            CoreClass::Performance => self.performance_cores,
            CoreClass::Efficiency => self.efficiency_cores,
        }
    }
}

/// Snapshot of the host CPU topology.
#[derive(Debug, Clone)]
pub struct CoreTopology {
    logical_cpus: usize,
    physical_cores: usize,
    numa_nodes: Vec<usize>,
    hybrid: Option<HybridLayout>,
}

impl CoreTopology {
    /// Query the host.
    pub fn detect() -> Self {
        let logical_cpus = num_cpus::get().max(1);
        let physical_cores = num_cpus::get_physical().max(1);
        let numa_nodes = detect_numa_nodes();
        let hybrid = detect_hybrid(logical_cpus);
        Self { logical_cpus, physical_cores, numa_nodes, hybrid }
    }

    /// Deterministic construction for tests and embedders that already
    /// know the layout.
    pub fn from_parts(
        logical_cpus: usize,
        physical_cores: usize,
        numa_nodes: Vec<usize>,
        hybrid: Option<HybridLayout>,
    ) -> Self {
        let numa_nodes = if numa_nodes.is_empty() { vec![0] } else { numa_nodes };
        Self {
            logical_cpus: logical_cpus.max(1),
            physical_cores: physical_cores.max(1),
            numa_nodes,
            hybrid,
        }
    }

    pub fn logical_cpus(&self) -> usize {
        self.logical_cpus
    }

    pub fn physical_cores(&self) -> usize {
        self.physical_cores
    }

    /// Available NUMA node ids, ascending. Never empty.
    pub fn numa_nodes(&self) -> &[usize] {
        &self.numa_nodes
    }

    /// Hybrid core-class layout, if the host exposes one.
    pub fn hybrid(&self) -> Option<HybridLayout> {
        self.hybrid
    }

    /// Logical CPU ids belonging to one NUMA node, assuming the usual
    /// contiguous-range layout. Used for NUMA-mask binding.
    pub fn cpus_of_node(&self, node: usize) -> Vec<usize> {
        let nodes = self.numa_nodes.len();
        let per_node = (self.logical_cpus + nodes - 1) / nodes;
        let index = self
            .numa_nodes
            .iter()
            .position(|&n| n == node)
            .unwrap_or(0);
        let start = index * per_node;
        let end = ((index + 1) * per_node).min(self.logical_cpus);
        (start..end).collect()
    }
}

#[cfg(target_os = "linux")]
fn detect_numa_nodes() -> Vec<usize> {
    let mut nodes: Vec<usize> = Vec::new();
    if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node") {
                if let Ok(id) = id.parse::<usize>() {
                    nodes.push(id);
                }
            }
        }
    }
    nodes.sort_unstable();
    if nodes.is_empty() {
        nodes.push(0);
    }
    nodes
}

#[cfg(not(target_os = "linux"))]
fn detect_numa_nodes() -> Vec<usize> {
    vec![0]
}

/// Infer hybrid core classes from per-cpu max frequencies: on Intel hybrid
/// parts the P-cores report a strictly higher cpuinfo_max_freq than the
/// E-cores. Two distinct frequency groups means a hybrid layout.
#[cfg(target_os = "linux")]
fn detect_hybrid(logical_cpus: usize) -> Option<HybridLayout> {
    let mut freqs = Vec::with_capacity(logical_cpus);
    for cpu in 0..logical_cpus {
        let path =
            format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/cpuinfo_max_freq");
        let khz = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())?;
        freqs.push(khz);
    }
    classify_by_frequency(&freqs)
}

#[cfg(not(target_os = "linux"))]
fn detect_hybrid(_logical_cpus: usize) -> Option<HybridLayout> {
    None
}

fn classify_by_frequency(freqs: &[u64]) -> Option<HybridLayout> {
    let max = *freqs.iter().max()?;
    let min = *freqs.iter().min()?;
    if max == min {
        return None;
    }
    let performance_cores = freqs.iter().filter(|&&f| f == max).count();
    Some(HybridLayout {
        performance_cores,
        efficiency_cores: freqs.len() - performance_cores,
    })
}
