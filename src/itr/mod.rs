// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! The pair iterator algebra.
//!
//! Every iterator walks (key, value1, value2, count) tuples of one
//! permutation in ascending (key, value1, value2) order. The core trait only
//! covers forward iteration and cardinality; seeking, marking and key-only
//! enumeration are separate capabilities an iterator may or may not expose.
//! Asking an iterator for a capability it lacks yields
//! [`TridentError::Unsupported`].

use std::fmt;

use crate::errs::{
    Result,
    TridentError,
};

pub mod aggr;
pub mod array;
pub mod composite;
pub mod composite_scan;
pub mod composite_term;
pub mod diff;
pub mod filter;
pub mod reorder;
pub mod rm;
pub mod scan;
pub mod term;

pub use aggr::AggrItr;
pub use array::{
    ArrayItr,
    EmptyItr,
};
pub use composite::CompositeItr;
pub use composite_scan::CompositeScanItr;
pub use composite_term::{
    CompositeTermItr,
    RmCompositeTermItr,
};
pub use diff::{
    Diff1Itr,
    DiffScanItr,
    DiffTermItr,
};
pub use filter::FilterSameItr;
pub use reorder::ReOrderItr;
pub use rm::RmItr;
pub use scan::ScanItr;
pub use term::TermItr;

pub use crate::table::TableItr;

/// Discriminates iterator variants, mostly for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItrKind {
    Row,
    Cluster,
    Column,
    Array,
    Empty,
    Term,
    Scan,
    Aggr,
    Composite,
    CompositeScan,
    CompositeTerm,
    RmCompositeTerm,
    Diff1,
    DiffTerm,
    DiffScan,
    Rm,
    ReOrder,
    FilterSame,
}

pub trait PairItr: Send {
    fn kind(&self) -> ItrKind;

    /// The first column of the current tuple.
    fn key(&self) -> i64;

    fn set_key(&mut self, key: i64);

    fn value1(&self) -> i64;

    fn value2(&self) -> i64;

    /// Number of tuples folded into the current one: the group size when the
    /// second column is ignored, otherwise usually one.
    fn count(&mut self) -> Result<u64>;

    /// Look-ahead only; repeated calls without `next` return the same answer.
    fn has_next(&mut self) -> Result<bool>;

    /// Advances to the next tuple. Advancing an exhausted iterator is a
    /// [`TridentError::ProtocolMisuse`].
    fn next(&mut self) -> Result<()>;

    /// Exact number of tuples this iterator yields from its start.
    fn cardinality(&mut self) -> Result<u64>;

    fn est_cardinality(&mut self) -> Result<u64>;

    fn constraint1(&self) -> Option<i64>;

    fn constraint2(&self) -> Option<i64>;

    fn set_constraint1(&mut self, c: Option<i64>);

    fn set_constraint2(&mut self, c: Option<i64>);

    fn is_second_column_ignored(&self) -> bool {
        false
    }

    fn as_seekable(&mut self) -> Option<&mut dyn Seekable> {
        None
    }

    fn as_key_seekable(&mut self) -> Option<&mut dyn KeySeekable> {
        None
    }

    fn as_markable(&mut self) -> Option<&mut dyn Markable> {
        None
    }

    fn as_column_ignorable(&mut self) -> Option<&mut dyn ColumnIgnorable> {
        None
    }
}

/// Forward positioning on (value1, value2).
pub trait Seekable {
    /// Positions the iterator so the next call to `next` yields the first
    /// tuple `>= (c1, c2)`. Targets at or before the current tuple leave the
    /// iterator on the current tuple, which `next` yields again.
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()>;
}

/// Forward positioning on the first column.
pub trait KeySeekable {
    /// After this call `next` yields the first tuple whose key is `>= key`.
    fn goto_key(&mut self, key: i64) -> Result<()>;
}

pub trait Markable {
    fn mark(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;
}

/// Switches to key/value1 enumeration: each group of equal value1 is emitted
/// once and `count` reports its size.
pub trait ColumnIgnorable {
    fn ignore_second_column(&mut self) -> Result<()>;
}

pub type BoxedItr = Box<dyn PairItr>;

/// Capability calls that fail with [`TridentError::Unsupported`] when the
/// iterator lacks the capability.
pub trait PairItrExt {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()>;

    fn goto_key(&mut self, key: i64) -> Result<()>;

    fn mark(&mut self) -> Result<()>;

    fn reset(&mut self) -> Result<()>;

    fn ignore_second_column(&mut self) -> Result<()>;

    /// Drains the iterator into (key, value1, value2, count) tuples.
    fn collect_tuples(&mut self) -> Result<Vec<(i64, i64, i64, u64)>>;
}

impl<T: PairItr + ?Sized> PairItrExt for T {
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        self.as_seekable()
            .ok_or(TridentError::Unsupported("moveto"))?
            .moveto(c1, c2)
    }

    fn goto_key(&mut self, key: i64) -> Result<()> {
        self.as_key_seekable()
            .ok_or(TridentError::Unsupported("goto_key"))?
            .goto_key(key)
    }

    fn mark(&mut self) -> Result<()> {
        self.as_markable()
            .ok_or(TridentError::Unsupported("mark"))?
            .mark()
    }

    fn reset(&mut self) -> Result<()> {
        self.as_markable()
            .ok_or(TridentError::Unsupported("reset"))?
            .reset()
    }

    fn ignore_second_column(&mut self) -> Result<()> {
        self.as_column_ignorable()
            .ok_or(TridentError::Unsupported("ignore_second_column"))?
            .ignore_second_column()
    }

    fn collect_tuples(&mut self) -> Result<Vec<(i64, i64, i64, u64)>> {
        let mut out = Vec::new();
        while self.has_next()? {
            self.next()?;
            out.push((self.key(), self.value1(), self.value2(), self.count()?));
        }
        Ok(out)
    }
}

impl fmt::Debug for dyn PairItr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairItr")
            .field("kind", &self.kind())
            .field("key", &self.key())
            .field("v1", &self.value1())
            .field("v2", &self.value2())
            .finish()
    }
}

/// Orders two tuples on (value1, value2), or on value1 alone when the second
/// column is ignored.
#[inline]
pub(crate) fn cmp_pair(a: (i64, i64), b: (i64, i64), ignore_second: bool) -> std::cmp::Ordering {
    if ignore_second {
        a.0.cmp(&b.0)
    } else {
        a.cmp(&b)
    }
}

/// Boilerplate shared by every iterator for the key and constraint fields.
macro_rules! constraint_accessors {
    () => {
        fn key(&self) -> i64 {
            self.key
        }

        fn set_key(&mut self, key: i64) {
            self.key = key;
        }

        fn constraint1(&self) -> Option<i64> {
            self.c1
        }

        fn constraint2(&self) -> Option<i64> {
            self.c2
        }

        fn set_constraint1(&mut self, c: Option<i64>) {
            self.c1 = c;
        }

        fn set_constraint2(&mut self, c: Option<i64>) {
            self.c2 = c;
        }
    };
}

pub(crate) use constraint_accessors;
