// ABOUTME: Deterministic per-sandbox subnet derivation and isolated network management
// ABOUTME: Hash-buckets sandbox ids into 172.x.y.0/24 blocks and probes past blocks already in use

use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::policy::NetworkIsolation;
use crate::providers::{NetworkSpec, Provider, ProviderError};

/// Second octets available to sandboxes; 17 and 18 belong to the engine's defaults
pub const SECOND_OCTETS: [u8; 14] = [16, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31];

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// A `172.<second>.<third>.0/24` block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub second: u8,
    pub third: u8,
}

impl Subnet {
    pub fn cidr(&self) -> String {
        format!("172.{}.{}.0/24", self.second, self.third)
    }

    pub fn gateway(&self) -> String {
        format!("172.{}.{}.1", self.second, self.third)
    }

    /// Parse a CIDR string if it is a block in the sandbox range
    pub fn parse(cidr: &str) -> Option<Self> {
        let (addr, prefix) = cidr.split_once('/')?;
        if prefix != "24" {
            return None;
        }
        let octets: Vec<u8> = addr
            .split('.')
            .map(|o| o.parse::<u8>())
            .collect::<Result<_, _>>()
            .ok()?;
        match octets.as_slice() {
            [172, second, third, 0] if SECOND_OCTETS.contains(second) => Some(Self {
                second: *second,
                third: *third,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.cidr())
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Derive the home block of a sandbox. Pure: the same id always yields the same block.
pub fn derive_subnet(sandbox_id: &str) -> Subnet {
    let hash = fnv1a(sandbox_id.as_bytes());
    let second = SECOND_OCTETS[(hash & 0xff) as usize % SECOND_OCTETS.len()];
    let third = ((hash >> 8) & 0xff) as u8;
    Subnet { second, third }
}

/// Pick a free block for a sandbox, starting from its derived block.
///
/// Probes the third octet first, then moves through the second-octet set.
/// Returns None only when every block is taken.
pub fn allocate_subnet(sandbox_id: &str, in_use: &HashSet<Subnet>) -> Option<Subnet> {
    let home = derive_subnet(sandbox_id);
    let start = SECOND_OCTETS
        .iter()
        .position(|o| *o == home.second)
        .unwrap_or(0);

    for step in 0..SECOND_OCTETS.len() {
        let second = SECOND_OCTETS[(start + step) % SECOND_OCTETS.len()];
        for offset in 0..=255u8 {
            let candidate = Subnet {
                second,
                third: home.third.wrapping_add(offset),
            };
            if !in_use.contains(&candidate) {
                return Some(candidate);
            }
        }
    }

    None
}

/// Deterministic network name for a sandbox
pub fn network_name(sandbox_id: &str) -> String {
    format!("devbox-net-{}", sandbox_id)
}

/// Result of a best-effort cleanup step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Done,
    Skipped,
    Failed(String),
}

impl CleanupOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Create (or reuse) the isolated network of a sandbox and return its name.
///
/// Returns None when the isolation mode shares the engine's default network.
pub async fn create_isolated_network(
    provider: &dyn Provider,
    sandbox_id: &str,
    isolation: NetworkIsolation,
) -> Result<Option<String>, ProviderError> {
    if isolation == NetworkIsolation::Shared {
        return Ok(None);
    }

    let name = network_name(sandbox_id);
    if provider.find_network(&name).await?.is_some() {
        debug!("Reusing network {} for sandbox {}", name, sandbox_id);
        return Ok(Some(name));
    }

    let in_use: HashSet<Subnet> = provider
        .list_networks()
        .await?
        .iter()
        .flat_map(|n| n.subnets.iter())
        .filter_map(|cidr| Subnet::parse(cidr))
        .collect();

    let subnet = allocate_subnet(sandbox_id, &in_use).ok_or_else(|| {
        ProviderError::NetworkError("No free sandbox subnet available".to_string())
    })?;

    if subnet != derive_subnet(sandbox_id) {
        info!(
            "Derived subnet for sandbox {} is taken, using {}",
            sandbox_id, subnet
        );
    }

    let spec = NetworkSpec {
        name: name.clone(),
        subnet: subnet.cidr(),
        gateway: subnet.gateway(),
        internal: isolation == NetworkIsolation::Internal,
        labels: HashMap::from([("devbox.sandbox.id".to_string(), sandbox_id.to_string())]),
    };

    let network_id = provider.create_network(&spec).await?;
    info!(
        "Created network {} ({}) on {} for sandbox {}",
        name, network_id, spec.subnet, sandbox_id
    );
    Ok(Some(name))
}

/// Remove the isolated network of a sandbox. Never fails; the outcome is reported.
pub async fn remove_isolated_network(provider: &dyn Provider, sandbox_id: &str) -> CleanupOutcome {
    let name = network_name(sandbox_id);

    match provider.find_network(&name).await {
        Ok(None) => CleanupOutcome::Skipped,
        Ok(Some(_)) => match provider.remove_network(&name).await {
            Ok(()) => {
                info!("Removed network {}", name);
                CleanupOutcome::Done
            }
            Err(ProviderError::NotFound(_)) => CleanupOutcome::Skipped,
            Err(e) => {
                warn!("Failed to remove network {}: {}", name, e);
                CleanupOutcome::Failed(e.to_string())
            }
        },
        Err(e) => {
            warn!("Failed to look up network {}: {}", name, e);
            CleanupOutcome::Failed(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0x811c9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_derive_subnet_is_pure() {
        for id in ["sbx_1", "sbx_2", "0b9d7a3e-44f1-4c2a-9a55-51b6d0a1e0f2", ""] {
            assert_eq!(derive_subnet(id), derive_subnet(id));
        }
    }

    #[test]
    fn test_derive_subnet_stays_in_range() {
        for i in 0..2000 {
            let subnet = derive_subnet(&format!("sandbox-{}", i));
            assert!(SECOND_OCTETS.contains(&subnet.second));
            assert_ne!(subnet.second, 17);
            assert_ne!(subnet.second, 18);
        }
    }

    #[test]
    fn test_allocate_returns_home_block_when_free() {
        let id = "sbx_alloc";
        assert_eq!(
            allocate_subnet(id, &HashSet::new()),
            Some(derive_subnet(id))
        );
    }

    #[test]
    fn test_allocate_probes_past_taken_blocks() {
        let id = "sbx_collide";
        let home = derive_subnet(id);
        let next = Subnet {
            second: home.second,
            third: home.third.wrapping_add(1),
        };
        let in_use = HashSet::from([home, next]);

        let allocated = allocate_subnet(id, &in_use).unwrap();
        assert_eq!(allocated.second, home.second);
        assert_eq!(allocated.third, home.third.wrapping_add(2));
    }

    #[test]
    fn test_allocate_moves_to_next_second_octet_when_row_full() {
        let id = "sbx_full_row";
        let home = derive_subnet(id);
        let in_use: HashSet<Subnet> = (0..=255u8)
            .map(|third| Subnet {
                second: home.second,
                third,
            })
            .collect();

        let allocated = allocate_subnet(id, &in_use).unwrap();
        assert_ne!(allocated.second, home.second);
    }

    #[test]
    fn test_allocate_exhausted() {
        let in_use: HashSet<Subnet> = SECOND_OCTETS
            .iter()
            .flat_map(|second| (0..=255u8).map(move |third| Subnet { second: *second, third }))
            .collect();
        assert_eq!(allocate_subnet("any", &in_use), None);
    }

    #[test]
    fn test_subnet_parse() {
        let subnet = Subnet {
            second: 24,
            third: 7,
        };
        assert_eq!(Subnet::parse(&subnet.cidr()), Some(subnet));
        assert_eq!(subnet.gateway(), "172.24.7.1");
        assert_eq!(Subnet::parse("172.17.0.0/16"), None);
        assert_eq!(Subnet::parse("10.0.0.0/24"), None);
        assert_eq!(Subnet::parse("garbage"), None);
    }
}
