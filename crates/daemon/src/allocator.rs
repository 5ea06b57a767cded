use portalloc_common::{AllocationError, PortAllocation, PortBinding, MAX_PORT, MIN_PORT};

pub type Result<T> = std::result::Result<T, AllocationError>;

/// Owns the `(server_id, port, protocol) -> owner` mapping.
///
/// Implementations must make the conflict check and the insert atomic with
/// respect to other callers, and `allocate_multiple_ports` must never leave
/// a partial batch visible.
pub trait PortAllocator: Send + Sync {
    /// Reserve one port. Validates port, protocol and owner in that order,
    /// then fails with `PortConflict` if the triple is already held by anyone.
    fn allocate_port(&self, server_id: i64, port: i64, protocol: &str, owner_id: i64) -> Result<()>;

    /// Release one port. Releasing a port nobody holds succeeds.
    fn deallocate_port(&self, server_id: i64, port: i64, protocol: &str) -> Result<()>;

    /// No validation: an out-of-range port or unknown protocol is always available.
    fn is_port_available(&self, server_id: i64, port: i64, protocol: &str) -> Result<bool>;

    fn get_port_allocation(&self, server_id: i64, port: i64, protocol: &str) -> Result<PortAllocation>;

    fn list_allocated_ports(&self, server_id: i64) -> Result<Vec<PortAllocation>>;

    fn list_ports_by_owner(&self, owner_id: i64) -> Result<Vec<PortAllocation>>;

    /// Release everything `owner_id` holds on every server.
    fn deallocate_ports_by_owner(&self, owner_id: i64) -> Result<()>;

    /// All-or-nothing reservation of several ports for one owner.
    ///
    /// On failure the owner holds none of the ports from this call; ports it
    /// held before the call are left alone.
    fn allocate_multiple_ports(&self, server_id: i64, bindings: &[PortBinding], owner_id: i64) -> Result<()>;

    /// First-fit scan of `[start_port, end_port]` in ascending order.
    fn get_available_ports_in_range(
        &self,
        server_id: i64,
        protocol: &str,
        start_port: i64,
        end_port: i64,
        limit: usize,
    ) -> Result<Vec<u16>>;
}

/// Intersect the requested scan window with the valid port space.
pub(crate) fn clamp_range(start_port: i64, end_port: i64) -> Option<(u16, u16)> {
    let start = start_port.max(MIN_PORT);
    let end = end_port.min(MAX_PORT);
    if start > end {
        return None;
    }
    Some((start as u16, end as u16))
}

/// Ascending walk over `[start, end]` skipping `taken`, stopping at `limit`.
pub(crate) fn first_free(start: u16, end: u16, limit: usize, taken: impl Fn(u16) -> bool) -> Vec<u16> {
    (start..=end).filter(|port| !taken(*port)).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(8080, 8090), Some((8080, 8090)));
        assert_eq!(clamp_range(-10, 3), Some((1, 3)));
        assert_eq!(clamp_range(65530, 70000), Some((65530, 65535)));
        assert_eq!(clamp_range(9000, 8000), None);
        assert_eq!(clamp_range(70000, 80000), None);
    }

    #[test]
    fn test_first_free_stops_at_limit() {
        let taken = [8080u16, 8081, 8083];
        let ports = first_free(8080, 8090, 5, |p| taken.contains(&p));
        assert_eq!(ports, vec![8082, 8084, 8085, 8086, 8087]);

        assert!(first_free(8080, 8090, 0, |_| false).is_empty());
        assert_eq!(first_free(65534, 65535, 10, |_| false), vec![65534, 65535]);
    }
}
