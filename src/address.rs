//! Subnet-aware address allocation.
//!
//! New nodes clone the template node's interfaces, one per subnet, and
//! each clone needs an address that no other VM in the application uses.
//! The allocator is pure: given a snapshot of the in-use addresses on a
//! subnet it deterministically picks `max + step`, failing when that
//! would leave the subnet.

use std::net::Ipv4Addr;

use crate::api::models::AppScope;
use crate::api::Application;
use crate::Error;

/// The network address of `ip` under `mask`.
#[must_use]
pub fn subnet_of(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & u32::from(mask))
}

/// Every static address in the application on `subnet`/`mask`.
///
/// Both the live deployment and the design-time draft are scanned: a
/// drafted-but-unpublished node already owns its address.
#[must_use]
pub fn subnet_addresses(app: &Application, subnet: Ipv4Addr, mask: Ipv4Addr) -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    for scope in [AppScope::Deployment, AppScope::Design] {
        for vm in app.vms(scope) {
            for conn in &vm.network_connections {
                let Some(scfg) = conn.static_ip() else {
                    continue;
                };
                if scfg.mask == mask && subnet_of(scfg.ip, mask) == subnet {
                    addresses.push(scfg.ip);
                }
            }
        }
    }
    addresses
}

/// Pick the next unused address on `subnet`/`mask`.
///
/// Takes the maximum existing address in unsigned integer order and adds
/// `step`. The step is 1 when a batch creates several nodes (they
/// interleave sequentially) and 10 otherwise, leaving room for manual
/// assignments in between.
///
/// # Errors
/// [`Error::NoTemplateAddress`] when the subnet has no existing address
/// to extend from; [`Error::NoAddressAvailable`] when the increment
/// overflows into a different subnet.
pub fn allocate_next(
    existing: &[Ipv4Addr],
    subnet: Ipv4Addr,
    mask: Ipv4Addr,
    step: u32,
) -> Result<Ipv4Addr, Error> {
    let max = existing
        .iter()
        .map(|ip| u32::from(*ip))
        .max()
        .ok_or(Error::NoTemplateAddress { subnet, mask })?;

    let next = Ipv4Addr::from(max.wrapping_add(step));
    if subnet_of(next, mask) != subnet {
        return Err(Error::NoAddressAvailable { subnet, mask });
    }
    Ok(next)
}

/// Address step for a batch of `count` new nodes.
#[must_use]
pub fn address_step(count: u32) -> u32 {
    if count > 1 {
        1
    } else {
        10
    }
}
