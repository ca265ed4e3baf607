//! Key-to-server selection for the memshard client.
//!
//! Two interchangeable policies behind [`Selector`]:
//!
//! - **Weighted table** (the legacy policy): the server list is expanded
//!   into a flat bucket table of integer weights and a key picks a bucket
//!   by `hash mod sum`. Cheap, but adding a server remaps almost all keys.
//! - **Ketama ring**: every server contributes `points_per_unit × weight`
//!   points on a hash ring; a key routes to the first point at or after
//!   its own hash, wrapping at the top. Adding a server remaps ~1/N of
//!   keys.
//!
//! Both policies hash with CRC-32 (IEEE), and the ring places its points
//! with the same hash over `"<identity>-<index>"` strings, so assignments
//! are identical across processes and runs. Selection is pure: a selector
//! never changes after construction, and reachability of a server has no
//! effect on routing. Failed servers surface failures to the caller
//! instead of silently remapping keys, which would desynchronize clients
//! that disagree about liveness.

use thiserror::Error;

/// Sum of integer weights in a [`WeightedTable`] must stay below this.
pub const WEIGHT_BUDGET: u32 = 32768;

/// Error constructing a selector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("selector needs at least one server")]
    NoServers,
    #[error("server weight must be positive")]
    NonPositiveWeight,
    #[error("sum of integer weights {0} exceeds the {WEIGHT_BUDGET} budget")]
    WeightBudgetExceeded(u32),
    #[error("ketama ring has zero total points")]
    EmptyRing,
}

/// Hash a key to 32 bits. The one hash family used for both key lookup
/// and ring point placement.
#[inline]
pub fn hash_key(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// A key-to-server-index selection policy. Immutable once built.
#[derive(Debug, Clone)]
pub enum Selector {
    Table(WeightedTable),
    Ketama(Ring),
}

impl Selector {
    /// Build from `(identity, weight)` pairs. `points_per_unit == 0`
    /// selects the legacy weighted table; any positive value builds a
    /// ketama ring with that many points per unit of weight.
    ///
    /// `identity` is the canonical server address string; it only matters
    /// for ketama point placement.
    pub fn build(servers: &[(String, f64)], points_per_unit: u32) -> Result<Self, BuildError> {
        if points_per_unit == 0 {
            WeightedTable::build(servers).map(Selector::Table)
        } else {
            Ring::build(servers, points_per_unit).map(Selector::Ketama)
        }
    }

    /// Route a key to a server index.
    #[inline]
    pub fn select(&self, key: &[u8]) -> usize {
        match self {
            Selector::Table(table) => table.select(hash_key(key)),
            Selector::Ketama(ring) => ring.select(hash_key(key)),
        }
    }

    /// Number of servers the selector was built over.
    pub fn server_count(&self) -> usize {
        match self {
            Selector::Table(table) => table.server_count(),
            Selector::Ketama(ring) => ring.server_count(),
        }
    }
}

/// Flat modulo-lookup table over integer weights.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTable {
    /// One entry per unit of weight; value is the owning server index.
    buckets: Box<[u16]>,
    server_count: u16,
}

impl WeightedTable {
    /// Expand `(identity, weight)` pairs into a bucket table.
    ///
    /// Fractional weights round half away from zero and are clamped to a
    /// minimum of one bucket per server.
    pub fn build(servers: &[(String, f64)]) -> Result<Self, BuildError> {
        if servers.is_empty() {
            return Err(BuildError::NoServers);
        }

        let mut buckets = Vec::new();
        for (index, (_, weight)) in servers.iter().enumerate() {
            if *weight <= 0.0 || !weight.is_finite() {
                return Err(BuildError::NonPositiveWeight);
            }
            let units = (weight.round() as u32).max(1);
            if buckets.len() as u32 + units >= WEIGHT_BUDGET {
                return Err(BuildError::WeightBudgetExceeded(
                    buckets.len() as u32 + units,
                ));
            }
            for _ in 0..units {
                buckets.push(index as u16);
            }
        }

        Ok(WeightedTable {
            buckets: buckets.into_boxed_slice(),
            server_count: servers.len() as u16,
        })
    }

    #[inline]
    pub fn select(&self, hash: u32) -> usize {
        self.buckets[(hash % self.buckets.len() as u32) as usize] as usize
    }

    pub fn server_count(&self) -> usize {
        self.server_count as usize
    }

    /// Total bucket count (the weight sum after rounding).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Ketama consistent-hash ring.
#[derive(Debug, Clone)]
pub struct Ring {
    /// `(point_hash, server_index)`, sorted by point hash. The sort is
    /// stable so that equal hashes keep construction order
    /// (server index, then sub-point index).
    points: Box<[(u32, u16)]>,
    server_count: u16,
}

impl Ring {
    /// Place `round(points_per_unit × weight)` points per server, each at
    /// `hash("<identity>-<index>")`.
    pub fn build(servers: &[(String, f64)], points_per_unit: u32) -> Result<Self, BuildError> {
        if servers.is_empty() {
            return Err(BuildError::NoServers);
        }

        let mut points = Vec::new();
        for (index, (identity, weight)) in servers.iter().enumerate() {
            if *weight <= 0.0 || !weight.is_finite() {
                return Err(BuildError::NonPositiveWeight);
            }
            let count = (points_per_unit as f64 * weight).round() as u64;
            for sub in 0..count {
                let label = format!("{identity}-{sub}");
                points.push((hash_key(label.as_bytes()), index as u16));
            }
        }
        if points.is_empty() {
            return Err(BuildError::EmptyRing);
        }

        points.sort_by_key(|&(hash, _)| hash);

        Ok(Ring {
            points: points.into_boxed_slice(),
            server_count: servers.len() as u16,
        })
    }

    /// First point with hash ≥ the key hash, wrapping to the lowest point.
    #[inline]
    pub fn select(&self, hash: u32) -> usize {
        let at = self.points.partition_point(|&(point, _)| point < hash);
        let at = if at == self.points.len() { 0 } else { at };
        self.points[at].1 as usize
    }

    pub fn server_count(&self) -> usize {
        self.server_count as usize
    }

    /// Total number of points on the ring.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}
