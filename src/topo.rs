//! Locality-domain topology (NUMA nodes and their execution contexts)

use crate::{Error, Result};
use std::fs;
use std::path::Path;

/// One locality domain: a group of CPUs sharing low-latency memory access
#[derive(Debug, Clone)]
pub struct LocalityDomain {
    pub id: usize,
    pub cpus: Vec<usize>,
}

/// The machine's locality layout, or a synthetic stand-in when the system
/// exposes none
#[derive(Debug, Clone)]
pub struct Topology {
    domains: Vec<LocalityDomain>,
}

impl Topology {
    /// Detect NUMA domains from sysfs; falls back to a single domain
    /// spanning every CPU when the system has no NUMA information or the
    /// `numa` feature is off.
    #[cfg(feature = "numa")]
    pub fn detect() -> Result<Self> {
        let nodes_path = Path::new("/sys/devices/system/node");
        if !nodes_path.exists() {
            return Ok(Self::uniform(1, num_cpus::get().max(1)));
        }

        let mut domains = Vec::new();
        for entry in fs::read_dir(nodes_path)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id_str) = name.strip_prefix("node") {
                if let Ok(id) = id_str.parse::<usize>() {
                    let cpus = node_cpus(id)?;
                    domains.push(LocalityDomain { id, cpus });
                }
            }
        }

        // Memory-only nodes have no CPUs and cannot host a queue
        domains.retain(|d| !d.cpus.is_empty());
        if domains.is_empty() {
            return Ok(Self::uniform(1, num_cpus::get().max(1)));
        }

        domains.sort_by_key(|d| d.id);
        Ok(Self { domains })
    }

    #[cfg(not(feature = "numa"))]
    pub fn detect() -> Result<Self> {
        Ok(Self::uniform(1, num_cpus::get().max(1)))
    }

    /// Build a synthetic topology of `num_domains` domains with
    /// `cpus_per_domain` contiguous CPUs each
    pub fn uniform(num_domains: usize, cpus_per_domain: usize) -> Self {
        let domains = (0..num_domains.max(1))
            .map(|id| LocalityDomain {
                id,
                cpus: (id * cpus_per_domain..(id + 1) * cpus_per_domain).collect(),
            })
            .collect();
        Self { domains }
    }

    pub fn num_domains(&self) -> usize {
        self.domains.len()
    }

    pub fn domains(&self) -> &[LocalityDomain] {
        &self.domains
    }

    pub fn domain(&self, id: usize) -> Option<&LocalityDomain> {
        self.domains.iter().find(|d| d.id == id)
    }

    pub fn domain_of_cpu(&self, cpu: usize) -> Option<usize> {
        self.domains
            .iter()
            .find(|d| d.cpus.contains(&cpu))
            .map(|d| d.id)
    }
}

fn node_cpus(node_id: usize) -> Result<Vec<usize>> {
    let path = format!("/sys/devices/system/node/node{}/cpulist", node_id);
    match fs::read_to_string(&path) {
        Ok(content) => parse_cpu_list(&content),
        Err(_) => Ok(Vec::new()),
    }
}

/// Parse a kernel CPU list such as "0-3,8,10-11"
pub fn parse_cpu_list(list: &str) -> Result<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            let start = start.parse::<usize>()?;
            let end = end.parse::<usize>()?;
            if end < start {
                return Err(Error::InvalidConfig(format!("bad cpu range '{}'", part)));
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(part.parse::<usize>()?);
        }
    }
    Ok(cpus)
}
