// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::fmt;

use crate::{
    codec,
    config::{
        KbConfig,
        THRESHOLD_KEEP_MEMORY,
    },
    errs::{
        Result,
        TridentError,
    },
};

/// Physical encoding of one table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TableLayout {
    Column = 3,
    Row = 4,
    Cluster = 5,
}

// bytes per width flag
const WIDTHS: [usize; 4] = [1, 2, 4, 5];
const AGGR_WIDTHS: [usize; 4] = [1, 2, 4, 8];

/// The one-byte strategy descriptor stored with every mark.
///
/// ```markdown
/// bit  7 6 5 | 4 3      | 2 1      | 0
///      layout| v1 width | v2 width | count width (cluster) / aggregated
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageStrat(u8);

/// Knobs consulted when picking a layout.
#[derive(Debug, Clone, Copy)]
pub struct StrategyParams {
    pub n_terms_cluster_column: usize,
    pub use_row_for_large_tables: bool,
    pub fixed: Option<u8>,
}

impl From<&KbConfig> for StrategyParams {
    fn from(cfg: &KbConfig) -> Self {
        StrategyParams {
            n_terms_cluster_column: cfg.n_terms_cluster_column(),
            use_row_for_large_tables: cfg.use_row_for_large_tables(),
            fixed: cfg.use_fixed_strategy().then_some(cfg.fixed_strategy()),
        }
    }
}

impl Default for StrategyParams {
    fn default() -> Self {
        (&KbConfig::default()).into()
    }
}

fn width_flag(nbytes: usize, table: &[usize; 4]) -> Result<u8> {
    table
        .iter()
        .position(|w| *w >= nbytes)
        .map(|p| p as u8)
        .ok_or_else(|| TridentError::misuse(format!("values of {nbytes} bytes cannot be stored")))
}

/// Rounds a byte count up to the nearest width a table can store.
pub(crate) fn storable_width(nbytes: usize) -> usize {
    WIDTHS
        .iter()
        .copied()
        .find(|w| *w >= nbytes)
        .unwrap_or(8)
}

impl StorageStrat {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b >> 5 {
            | 3..=5 => Ok(StorageStrat(b)),
            | other => Err(TridentError::corrupt(format!(
                "unknown table layout {other} in strategy byte {b:#04x}"
            ))),
        }
    }

    pub fn row(w1: usize, w2: usize) -> Result<Self> {
        let s = (TableLayout::Row as u8) << 5
            | width_flag(w1, &WIDTHS)? << 3
            | width_flag(w2, &WIDTHS)? << 1;
        Ok(StorageStrat(s))
    }

    /// A row table whose second column holds packed coordinates.
    pub fn aggregated_row(w1: usize, w2: usize) -> Result<Self> {
        let s = (TableLayout::Row as u8) << 5
            | width_flag(w1, &WIDTHS)? << 3
            | width_flag(w2, &AGGR_WIDTHS)? << 1
            | 1;
        Ok(StorageStrat(s))
    }

    pub fn cluster(w1: usize, w2: usize, wide_counts: bool) -> Result<Self> {
        let s = (TableLayout::Cluster as u8) << 5
            | width_flag(w1, &WIDTHS)? << 3
            | width_flag(w2, &WIDTHS)? << 1
            | wide_counts as u8;
        Ok(StorageStrat(s))
    }

    /// Column tables record their widths in their own header.
    pub fn column(aggregated: bool) -> Self {
        StorageStrat((TableLayout::Column as u8) << 5 | aggregated as u8)
    }

    #[inline]
    pub fn byte(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn layout(self) -> TableLayout {
        match self.0 >> 5 {
            | 3 => TableLayout::Column,
            | 4 => TableLayout::Row,
            | _ => TableLayout::Cluster,
        }
    }

    #[inline]
    pub fn is_aggregated(self) -> bool {
        self.0 & 1 == 1 && self.layout() != TableLayout::Cluster
    }

    #[inline]
    pub fn bytes_v1(self) -> usize {
        WIDTHS[((self.0 >> 3) & 3) as usize]
    }

    #[inline]
    pub fn bytes_v2(self) -> usize {
        let flag = ((self.0 >> 1) & 3) as usize;
        if self.is_aggregated() {
            AGGR_WIDTHS[flag]
        } else {
            WIDTHS[flag]
        }
    }

    /// Width of the per-group count in a cluster table.
    #[inline]
    pub fn bytes_count(self) -> usize {
        if self.0 & 1 == 1 {
            4
        } else {
            1
        }
    }

    /// Picks the cheapest layout for a group of sorted pairs.
    pub fn determine(pairs: &[(u64, u64)], params: &StrategyParams) -> Result<Self> {
        if let Some(fixed) = params.fixed {
            let strat = StorageStrat::from_byte(fixed)?;
            // a fixed layout still has to fit the data
            return Self::with_layout(strat.layout(), pairs);
        }
        if pairs.len() >= THRESHOLD_KEEP_MEMORY {
            return if params.use_row_for_large_tables {
                StorageStrat::row(5, 5)
            } else {
                Ok(StorageStrat::column(false))
            };
        }
        let shape = TableShape::of(pairs);
        if shape.ngroups >= params.n_terms_cluster_column {
            return Ok(StorageStrat::column(false));
        }
        let w1 = storable_width(codec::num_bytes(shape.max1));
        let w2 = storable_width(codec::num_bytes(shape.max2));
        let wc = if shape.max_group > 255 { 4 } else { 1 };
        let row_cost = pairs.len() * (w1 + w2);
        let cluster_cost = shape.ngroups * (w1 + wc) + pairs.len() * w2;
        if cluster_cost < row_cost {
            StorageStrat::cluster(w1, w2, wc == 4)
        } else {
            StorageStrat::row(w1, w2)
        }
    }

    /// A strategy of the given layout wide enough for `pairs`.
    pub fn with_layout(layout: TableLayout, pairs: &[(u64, u64)]) -> Result<Self> {
        let shape = TableShape::of(pairs);
        let w1 = storable_width(codec::num_bytes(shape.max1));
        let w2 = storable_width(codec::num_bytes(shape.max2));
        match layout {
            | TableLayout::Row => StorageStrat::row(w1, w2),
            | TableLayout::Cluster => StorageStrat::cluster(w1, w2, shape.max_group > 255),
            | TableLayout::Column => Ok(StorageStrat::column(false)),
        }
    }

    /// Whether a group is worth storing aggregated: few distinct first values
    /// relative to its size.
    pub fn determine_aggregated(pairs: &[(u64, u64)]) -> bool {
        let shape = TableShape::of(pairs);
        pairs.len() >= 10 && shape.ngroups <= pairs.len() / 10
    }
}

impl fmt::Debug for StorageStrat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageStrat")
            .field("layout", &self.layout())
            .field("v1", &self.bytes_v1())
            .field("v2", &self.bytes_v2())
            .field("aggregated", &self.is_aggregated())
            .finish()
    }
}

#[derive(Debug, Default)]
struct TableShape {
    max1: u64,
    max2: u64,
    ngroups: usize,
    max_group: usize,
}

impl TableShape {
    fn of(pairs: &[(u64, u64)]) -> Self {
        let mut shape = TableShape::default();
        let mut run = 0;
        let mut prev = None;
        for (v1, v2) in pairs {
            shape.max1 = shape.max1.max(*v1);
            shape.max2 = shape.max2.max(*v2);
            if prev != Some(*v1) {
                shape.ngroups += 1;
                run = 0;
                prev = Some(*v1);
            }
            run += 1;
            shape.max_group = shape.max_group.max(run);
        }
        shape
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_bits() {
        let s = StorageStrat::row(2, 5).unwrap();
        assert_eq!(s.layout(), TableLayout::Row);
        assert_eq!(s.bytes_v1(), 2);
        assert_eq!(s.bytes_v2(), 5);
        assert!(!s.is_aggregated());
        assert_eq!(StorageStrat::from_byte(s.byte()).unwrap(), s);

        let a = StorageStrat::aggregated_row(1, 8).unwrap();
        assert!(a.is_aggregated());
        assert_eq!(a.bytes_v2(), 8);

        let c = StorageStrat::cluster(3, 1, true).unwrap();
        assert_eq!(c.bytes_v1(), 4);
        assert_eq!(c.bytes_count(), 4);
        assert!(!c.is_aggregated());

        assert!(StorageStrat::row(6, 1).is_err());
        assert!(StorageStrat::from_byte(0x10).is_err());
    }

    #[test]
    fn test_determine_prefers_cluster_for_repeated_v1() {
        let params = StrategyParams::default();
        let grouped: Vec<(u64, u64)> = (0..100).map(|i| (1, i)).collect();
        let s = StorageStrat::determine(&grouped, &params).unwrap();
        assert_eq!(s.layout(), TableLayout::Cluster);

        let flat: Vec<(u64, u64)> = (0..100).map(|i| (i, i)).collect();
        let s = StorageStrat::determine(&flat, &params).unwrap();
        assert_eq!(s.layout(), TableLayout::Row);
        assert_eq!(s.bytes_v1(), 1);

        let params = StrategyParams {
            n_terms_cluster_column: 10,
            ..params
        };
        let s = StorageStrat::determine(&flat, &params).unwrap();
        assert_eq!(s.layout(), TableLayout::Column);
    }

    #[test]
    fn test_fixed_strategy_widens() {
        let params = StrategyParams {
            fixed: Some(StorageStrat::row(1, 1).unwrap().byte()),
            ..StrategyParams::default()
        };
        let s = StorageStrat::determine(&[(1, 70_000)], &params).unwrap();
        assert_eq!(s.layout(), TableLayout::Row);
        assert_eq!(s.bytes_v2(), 4);
    }

    #[test]
    fn test_aggregation_threshold() {
        let few: Vec<(u64, u64)> = (0..100).map(|i| (i / 50, i)).collect();
        assert!(StorageStrat::determine_aggregated(&few));
        let many: Vec<(u64, u64)> = (0..100).map(|i| (i, i)).collect();
        assert!(!StorageStrat::determine_aggregated(&many));
    }
}
