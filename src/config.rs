// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use getset::{
    CopyGetters,
    Setters,
};

/// Hard cap on the number of data files a single table storage may create.
pub const MAX_N_FILES: usize = 4096;
/// Hard cap on concurrently open file manager sessions.
pub const MAX_SESSIONS: usize = 1024;
/// Slots in the memory manager's block ring.
pub const MAX_N_BLOCKS_IN_CACHE: usize = 1_000_000;
/// Tables with fewer pairs than this are analysed in memory to pick a layout.
pub const THRESHOLD_KEEP_MEMORY: usize = 1000 * 1024;
/// Pairs buffered by a column inserter before spilling to a temporary file.
pub const THRESHOLD_TO_OFFLOAD: usize = 500_000_000;
/// Minimum growth step of a writable file.
pub const SMALLEST_INCR: usize = 16 * 1024 * 1024;
/// Bytes reserved when a writable file is first created.
pub const FILE_PREALLOC: usize = 1024 * 1024;
/// Buffered marks that force a flush of the `.idx` sidecar.
pub const MARKS_FLUSH_THRESHOLD: usize = 10_000_000;
/// Uncompressed size of one string buffer block.
pub const SB_BLOCK_SIZE: usize = 65536;

/// Runtime knobs for a knowledge base. Every component receives the values it
/// needs from here instead of reading process-wide statics.
#[derive(Debug, Clone, CopyGetters, Setters)]
#[getset(get_copy = "pub", set = "pub")]
pub struct KbConfig {
    read_only: bool,
    /// Number of permutations to materialize, either 1 (SPO only), 3 or 6.
    n_indices: usize,
    aggr_indices: bool,
    incomplete_indices: bool,
    threshold_skip_table: u64,
    use_fixed_strategy: bool,
    fixed_strategy: u8,
    n_terms_cluster_column: usize,
    use_row_for_large_tables: bool,
    table_max_file_size: usize,
    max_n_files: usize,
    max_open_files: usize,
    max_sessions: usize,
    cache_max_bytes: usize,
    max_blocks_in_cache: usize,
    threshold_to_offload: usize,
    marks_flush_threshold: usize,
    tree_max_elements_node: usize,
    tree_node_min_bytes: usize,
    tree_cache_max_nodes: usize,
    tree_compress_nodes: bool,
    tree_max_file_size: usize,
    sb_cache_blocks: usize,
    dict_partitions: usize,
    rels_ids_separated: bool,
    parallel_build: bool,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            read_only: true,
            n_indices: 6,
            aggr_indices: false,
            incomplete_indices: false,
            threshold_skip_table: 10,
            use_fixed_strategy: false,
            fixed_strategy: 0,
            n_terms_cluster_column: 1_000_000,
            use_row_for_large_tables: false,
            table_max_file_size: 64 * 1024 * 1024,
            max_n_files: MAX_N_FILES,
            max_open_files: 1000,
            max_sessions: MAX_SESSIONS,
            cache_max_bytes: 1024 * 1024 * 1024,
            max_blocks_in_cache: MAX_N_BLOCKS_IN_CACHE,
            threshold_to_offload: THRESHOLD_TO_OFFLOAD,
            marks_flush_threshold: MARKS_FLUSH_THRESHOLD,
            tree_max_elements_node: 2048,
            tree_node_min_bytes: 128,
            tree_cache_max_nodes: 10_000,
            tree_compress_nodes: true,
            tree_max_file_size: 64 * 1024 * 1024,
            sb_cache_blocks: 1000,
            dict_partitions: 1,
            rels_ids_separated: false,
            parallel_build: true,
        }
    }
}

impl KbConfig {
    /// A configuration suited to building a new knowledge base.
    pub fn for_writing() -> Self {
        let mut cfg = Self::default();
        cfg.set_read_only(false);
        cfg
    }
}
