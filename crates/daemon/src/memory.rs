use crate::allocator::{clamp_range, first_free, PortAllocator, Result};
use chrono::Utc;
use portalloc_common::{
    validate_owner, validate_port, validate_request, AllocationError, PortAllocation, PortBinding, Protocol,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

type Key = (i64, u16, Protocol);

/// In-process allocator. Only safe as the source of truth for a single
/// instance; used as a test double and for `--memory` runs.
#[derive(Debug, Default)]
pub struct MemoryAllocator {
    allocations: Mutex<HashMap<Key, PortAllocation>>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Key, PortAllocation>>> {
        self.allocations
            .lock()
            .map_err(|_| AllocationError::store("allocation map lock poisoned"))
    }
}

/// Parse a lookup key without reporting why it is invalid; an invalid key
/// can never be allocated.
fn lookup_key(server_id: i64, port: i64, protocol: &str) -> Option<Key> {
    let port = validate_port(port).ok()?;
    let protocol = protocol.parse::<Protocol>().ok()?;
    Some((server_id, port, protocol))
}

fn insert(
    map: &mut HashMap<Key, PortAllocation>,
    server_id: i64,
    port: u16,
    protocol: Protocol,
    owner_id: i64,
) -> Result<Key> {
    let key = (server_id, port, protocol);
    if let Some(existing) = map.get(&key) {
        return Err(AllocationError::PortConflict {
            server_id,
            port,
            protocol,
            existing_owner: existing.owner_id,
            requested_owner: owner_id,
        });
    }
    map.insert(
        key,
        PortAllocation {
            server_id,
            port,
            protocol,
            owner_id,
            allocated_at: Utc::now(),
        },
    );
    Ok(key)
}

fn sorted(mut allocations: Vec<PortAllocation>) -> Vec<PortAllocation> {
    allocations.sort_by_key(|a| (a.server_id, a.port, a.protocol));
    allocations
}

impl PortAllocator for MemoryAllocator {
    fn allocate_port(&self, server_id: i64, port: i64, protocol: &str, owner_id: i64) -> Result<()> {
        let (port, protocol) = validate_request(port, protocol, owner_id)?;
        let mut map = self.lock()?;
        insert(&mut map, server_id, port, protocol, owner_id)?;
        Ok(())
    }

    fn deallocate_port(&self, server_id: i64, port: i64, protocol: &str) -> Result<()> {
        if let Some(key) = lookup_key(server_id, port, protocol) {
            self.lock()?.remove(&key);
        }
        Ok(())
    }

    fn is_port_available(&self, server_id: i64, port: i64, protocol: &str) -> Result<bool> {
        match lookup_key(server_id, port, protocol) {
            Some(key) => Ok(!self.lock()?.contains_key(&key)),
            None => Ok(true),
        }
    }

    fn get_port_allocation(&self, server_id: i64, port: i64, protocol: &str) -> Result<PortAllocation> {
        let found = match lookup_key(server_id, port, protocol) {
            Some(key) => self.lock()?.get(&key).cloned(),
            None => None,
        };
        found.ok_or_else(|| AllocationError::PortNotFound {
            server_id,
            port,
            protocol: protocol.to_string(),
        })
    }

    fn list_allocated_ports(&self, server_id: i64) -> Result<Vec<PortAllocation>> {
        let map = self.lock()?;
        Ok(sorted(
            map.values().filter(|a| a.server_id == server_id).cloned().collect(),
        ))
    }

    fn list_ports_by_owner(&self, owner_id: i64) -> Result<Vec<PortAllocation>> {
        let map = self.lock()?;
        Ok(sorted(
            map.values().filter(|a| a.owner_id == owner_id).cloned().collect(),
        ))
    }

    fn deallocate_ports_by_owner(&self, owner_id: i64) -> Result<()> {
        self.lock()?.retain(|_, a| a.owner_id != owner_id);
        Ok(())
    }

    fn allocate_multiple_ports(&self, server_id: i64, bindings: &[PortBinding], owner_id: i64) -> Result<()> {
        validate_owner(owner_id)?;
        let requested = bindings
            .iter()
            .map(|b| -> Result<(u16, Protocol)> {
                Ok((validate_port(b.host_port)?, b.protocol.parse::<Protocol>()?))
            })
            .collect::<Result<Vec<_>>>()?;

        // The lock is held across both phases, so nobody observes a partial batch.
        let mut map = self.lock()?;

        for &(port, protocol) in &requested {
            if let Some(existing) = map.get(&(server_id, port, protocol)) {
                return Err(AllocationError::PortConflict {
                    server_id,
                    port,
                    protocol,
                    existing_owner: existing.owner_id,
                    requested_owner: owner_id,
                });
            }
        }

        let mut created = Vec::with_capacity(requested.len());
        for &(port, protocol) in &requested {
            match insert(&mut map, server_id, port, protocol, owner_id) {
                Ok(key) => created.push(key),
                Err(err) => {
                    // Undo only what this call inserted.
                    for key in &created {
                        map.remove(key);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn get_available_ports_in_range(
        &self,
        server_id: i64,
        protocol: &str,
        start_port: i64,
        end_port: i64,
        limit: usize,
    ) -> Result<Vec<u16>> {
        let protocol = protocol.parse::<Protocol>()?;
        let Some((start, end)) = clamp_range(start_port, end_port) else {
            return Ok(Vec::new());
        };
        let map = self.lock()?;
        Ok(first_free(start, end, limit, |port| {
            map.contains_key(&(server_id, port, protocol))
        }))
    }
}
