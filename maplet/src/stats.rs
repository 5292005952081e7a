//! Maplet-level statistics snapshot.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapletStats {
    pub capacity: usize,
    pub size: usize,
    pub load_factor: f64,
    pub operator_errors: u64,
    pub resize_count: u64,
    pub remainder_bits: u32,
    /// Rough estimate; does not account for heap allocations inside
    /// `Value::Vector` entries.
    pub memory_bytes: usize,
}
