use std::net::Ipv4Addr;

use crate::error::{FleetError, Result};

const MAX_SUBNET_PREFIX: u8 = 30;

/// Pick the `/prefix` block of `base_cidr` owned by `cluster_name`.
///
/// The block index is `fnv1a32(cluster_name) mod 2^(prefix - base_prefix)`, so
/// the same name always lands on the same block. Two clusters whose names
/// hash to the same index share a block; nothing checks for that here.
pub fn derive_subnet_cidr(base_cidr: &str, prefix: u8, cluster_name: &str) -> Result<String> {
    let (base_ip, base_prefix) = parse_ipv4_cidr(base_cidr)?;
    if prefix < base_prefix {
        return Err(FleetError::InvalidAddressBlock(format!(
            "subnet prefix {prefix} is smaller than base prefix {base_prefix}"
        )));
    }
    if prefix > MAX_SUBNET_PREFIX {
        return Err(FleetError::InvalidAddressBlock(format!(
            "subnet prefix must be <= {MAX_SUBNET_PREFIX}"
        )));
    }

    let count = 1u64 << (prefix - base_prefix);
    let index = u64::from(fnv1a32(cluster_name.as_bytes())) % count;
    let block_size = 1u64 << (32 - prefix);

    // Start from the network address so a host-bit base like 10.0.0.5/16 still
    // yields blocks inside the base.
    let network = u32::from(base_ip) & prefix_mask(base_prefix);
    let subnet = u64::from(network) + index * block_size;
    let subnet = Ipv4Addr::from(subnet as u32);
    Ok(format!("{subnet}/{prefix}"))
}

/// Parse `a.b.c.d/n` into its address and prefix length.
pub fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let invalid = || FleetError::InvalidAddressBlock(format!("{cidr} is not an IPv4 CIDR block"));
    let (addr, len) = cidr.trim().split_once('/').ok_or_else(invalid)?;
    let ip: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = len.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok((ip, prefix))
}

/// True when `inner` lies entirely inside `outer`.
pub fn cidr_contains(outer: &str, inner: &str) -> Result<bool> {
    let (outer_ip, outer_prefix) = parse_ipv4_cidr(outer)?;
    let (inner_ip, inner_prefix) = parse_ipv4_cidr(inner)?;
    if inner_prefix < outer_prefix {
        return Ok(false);
    }
    let mask = prefix_mask(outer_prefix);
    Ok(u32::from(outer_ip) & mask == u32::from(inner_ip) & mask)
}

fn prefix_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

/// 32-bit FNV-1a.
fn fnv1a32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_block_is_inside_base() {
        let cidr = derive_subnet_cidr("10.200.0.0/16", 24, "my-cluster").unwrap();
        assert!(cidr.ends_with("/24"));
        assert!(cidr_contains("10.200.0.0/16", &cidr).unwrap());
    }

    #[test]
    fn same_name_same_block() {
        let first = derive_subnet_cidr("10.200.0.0/16", 24, "alpha").unwrap();
        for _ in 0..10 {
            assert_eq!(derive_subnet_cidr("10.200.0.0/16", 24, "alpha").unwrap(), first);
        }
    }

    #[test]
    fn known_fnv_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }

    #[test]
    fn equal_prefix_returns_base() {
        assert_eq!(
            derive_subnet_cidr("10.1.0.0/24", 24, "anything").unwrap(),
            "10.1.0.0/24"
        );
    }

    #[test]
    fn many_names_stay_inside_base() {
        for i in 0..200 {
            let name = format!("cluster-{i}");
            let cidr = derive_subnet_cidr("172.16.0.0/12", 28, &name).unwrap();
            assert!(cidr_contains("172.16.0.0/12", &cidr).unwrap(), "{cidr}");
        }
    }

    #[test]
    fn rejects_bad_inputs() {
        for (base, prefix) in [
            ("not-a-cidr", 24),
            ("10.0.0.0", 24),
            ("fd00::/8", 64),
            ("10.0.0.0/16", 8),
            ("10.0.0.0/16", 31),
        ] {
            let err = derive_subnet_cidr(base, prefix, "x").unwrap_err();
            assert!(matches!(err, FleetError::InvalidAddressBlock(_)), "{base} /{prefix}");
        }
    }
}
