// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Trident is an RDF triple store. Triples of dictionary-encoded terms are
//! indexed in up to six permutations, each a set of per-key tables laid out
//! by rows, clusters or columns and located through a coordinates tree.
//! Queries walk the tables through a small algebra of pair iterators, and
//! updates are layered over an immutable knowledge base as differential
//! indices merged at query time.

pub mod codec;
pub mod config;
pub mod dict;
pub mod diff;
pub mod errs;
/// Segmented files, their sessions and the index of their blocks.
pub mod fs;
pub mod itr;
pub mod kb;
pub mod memory;
pub mod perm;
pub mod stats;
pub mod table;
pub mod tree;

pub use config::KbConfig;
pub use diff::DiffKind;
pub use errs::{
    Result,
    TridentError,
};
pub use itr::{
    BoxedItr,
    PairItr,
    PairItrExt,
};
pub use kb::{
    Kb,
    KbBuilder,
    Querier,
};
pub use perm::Permutation;
