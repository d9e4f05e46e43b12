// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

//! Term dictionaries.
//!
//! A [`Dict`] is one partition: a text to id tree, an id to position tree
//! and the [`StringBuffer`] holding the text. [`DictMgmt`] layers the main
//! partition, update partitions routed by id range, and the in-memory global
//! update dictionary (GUD) for small vocabularies added after the build.

use std::{
    cmp::Ordering,
    collections::HashMap,
    fs,
    io::{
        BufRead,
        BufReader,
        Write,
    },
    path::{
        Path,
        PathBuf,
    },
    sync::atomic::{
        AtomicBool,
        AtomicU64,
        Ordering as AtomicOrdering,
    },
};

use crossbeam_skiplist::SkipMap;
use tracing::{
    debug,
    instrument,
    warn,
};

use crate::{
    config::KbConfig,
    errs::{
        Result,
        TridentError,
    },
    tree::{
        StringBuffer,
        Tree,
        TreeItr,
    },
};

/// Set on ids that carry an integer instead of a dictionary entry.
pub const DICTMGMT_INTEGER: u64 = 0x4000_0000_0000_0000;
/// Set on ids that carry a float instead of a dictionary entry.
pub const DICTMGMT_FLOAT: u64 = 0x8000_0000_0000_0000;

const TYPE_MASK: u64 = 0xC000_0000_0000_0000;
const GUD_FILE: &str = "gud";

pub fn is_numeric(term: u64) -> bool {
    term & TYPE_MASK != 0
}

pub fn numeric_type(term: u64) -> u64 {
    term & TYPE_MASK
}

pub fn int_value(term: u64) -> u64 {
    term & !TYPE_MASK
}

pub fn float_value(term: u64) -> f32 {
    f32::from_bits(term as u32)
}

/// Encodes an integer that fits 62 bits as a numeric term.
pub fn int_term(value: u64) -> Result<u64> {
    if value & TYPE_MASK != 0 {
        return Err(TridentError::misuse(format!("{value} does not fit a numeric term")));
    }
    Ok(value | DICTMGMT_INTEGER)
}

pub fn float_term(value: f32) -> u64 {
    value.to_bits() as u64 | DICTMGMT_FLOAT
}

/// Decimal rendering of a numeric term.
pub fn numeric_text(term: u64) -> String {
    if numeric_type(term) == DICTMGMT_INTEGER {
        int_value(term).to_string()
    } else {
        float_value(term).to_string()
    }
}

/// Orders two numeric terms by value, mixing integers and floats.
pub fn compare_numeric(a: u64, b: u64) -> Ordering {
    let as_f64 = |t: u64| {
        if numeric_type(t) == DICTMGMT_INTEGER {
            int_value(t) as f64
        } else {
            float_value(t) as f64
        }
    };
    match (numeric_type(a), numeric_type(b)) {
        | (DICTMGMT_INTEGER, DICTMGMT_INTEGER) => int_value(a).cmp(&int_value(b)),
        | _ => as_f64(a).total_cmp(&as_f64(b)),
    }
}

/// One dictionary partition.
pub struct Dict {
    dict: Tree<Vec<u8>, u64>,
    inv: Tree<u64, u64>,
    sb: StringBuffer,
}

impl Dict {
    #[instrument(level = "debug", skip(cfg))]
    pub fn open(dir: &Path, cfg: &KbConfig) -> Result<Self> {
        Ok(Self {
            dict: Tree::open(&dir.join("dict"), cfg)?,
            inv: Tree::open(&dir.join("invdict"), cfg)?,
            sb: StringBuffer::open(dir, cfg)?,
        })
    }

    pub fn len(&self) -> u64 {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }

    fn flush(&self) -> Result<()> {
        self.dict.flush()?;
        self.inv.flush()?;
        self.sb.flush()
    }
}

/// The dictionary facade handed to queriers and builders.
pub struct DictMgmt {
    dictionaries: Vec<Dict>,
    // first id served by each partition
    begin_range: Vec<u64>,
    read_only: bool,
    inserted: AtomicU64,
    largest_id: AtomicU64,
    gud_dir: PathBuf,
    gud_idtext: SkipMap<u64, Vec<u8>>,
    gud_textid: SkipMap<Vec<u8>, u64>,
    gud_modified: AtomicBool,
    gud_largest: AtomicU64,
    r2e: HashMap<u64, u64>,
    r2s: HashMap<u64, Vec<u8>>,
    s2r: HashMap<Vec<u8>, u64>,
}

impl DictMgmt {
    /// Wraps `main`, loading the GUD from `gud_dir` and the relation maps from
    /// `e2r` (lines `entity\trelation`) or, failing that, `e2s` (lines
    /// `relation\ttext`) when those files exist.
    #[instrument(level = "debug", skip(main))]
    pub fn open(main: Dict, read_only: bool, gud_dir: &Path, e2r: &Path, e2s: &Path) -> Result<Self> {
        let mut mgmt = Self {
            dictionaries: vec![main],
            begin_range: vec![0],
            read_only,
            inserted: AtomicU64::new(0),
            largest_id: AtomicU64::new(0),
            gud_dir: gud_dir.to_path_buf(),
            gud_idtext: SkipMap::new(),
            gud_textid: SkipMap::new(),
            gud_modified: AtomicBool::new(false),
            gud_largest: AtomicU64::new(0),
            r2e: HashMap::new(),
            r2s: HashMap::new(),
            s2r: HashMap::new(),
        };
        mgmt.load_gud()?;
        if e2r.exists() {
            mgmt.load_e2r(e2r)?;
        } else if e2s.exists() {
            mgmt.load_e2s(e2s)?;
        }
        Ok(mgmt)
    }

    fn load_gud(&mut self) -> Result<()> {
        let path = self.gud_dir.join(GUD_FILE);
        if !path.exists() {
            return Ok(());
        }
        let mut lines = BufReader::new(fs::File::open(&path)?).split(b'\n');
        let largest = match lines.next() {
            | Some(l) => parse_id(&l?, &path)?,
            | None => return Ok(()),
        };
        self.gud_largest.store(largest, AtomicOrdering::Relaxed);
        for line in lines {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let (id, text) = split_tab(&line).ok_or_else(|| {
                TridentError::corrupt(format!(
                    "bad line in {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&line)
                ))
            })?;
            let id = parse_id(id, &path)?;
            self.gud_idtext.insert(id, text.to_vec());
            self.gud_textid.insert(text.to_vec(), id);
        }
        debug!(terms = self.gud_idtext.len(), "loaded global update dictionary");
        Ok(())
    }

    fn load_e2r(&mut self, path: &Path) -> Result<()> {
        for line in BufReader::new(fs::File::open(path)?).split(b'\n') {
            let line = line?;
            let Some((e, r)) = split_tab(&line) else {
                continue;
            };
            let (e, r) = (parse_id(e, path)?, parse_id(r, path)?);
            self.r2e.insert(r, e);
            match self.get_text(e)? {
                | Some(text) => {
                    self.s2r.insert(text, r);
                },
                | None => warn!(entity = e, "no text for relation entity"),
            }
        }
        debug!(relations = self.r2e.len(), "loaded relation to entity map");
        Ok(())
    }

    fn load_e2s(&mut self, path: &Path) -> Result<()> {
        for line in BufReader::new(fs::File::open(path)?).split(b'\n') {
            let line = line?;
            let Some((r, text)) = split_tab(&line) else {
                continue;
            };
            let r = parse_id(r, path)?;
            self.s2r.insert(text.to_vec(), r);
            self.r2s.insert(r, text.to_vec());
        }
        debug!(relations = self.r2s.len(), "loaded relation to text map");
        Ok(())
    }

    /// Layers update partitions over the main one. Each serves the ids from
    /// its smallest inverse key on.
    pub fn add_updates(&mut self, updates: Vec<Dict>) -> Result<()> {
        for update in updates {
            let first = update
                .inv
                .smallest_key()?
                .ok_or_else(|| TridentError::corrupt("update dictionary without terms"))?;
            self.begin_range.push(first);
            self.dictionaries.push(update);
        }
        Ok(())
    }

    pub fn n_partitions(&self) -> usize {
        self.dictionaries.len()
    }

    fn partition(&self, id: u64) -> &Dict {
        let idx = self.begin_range.partition_point(|b| *b <= id).saturating_sub(1);
        &self.dictionaries[idx]
    }

    fn main(&self) -> &Dict {
        &self.dictionaries[0]
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(TridentError::misuse("insert into a read-only dictionary"));
        }
        Ok(())
    }

    fn note_insert(&self, id: u64) {
        self.inserted.fetch_add(1, AtomicOrdering::Relaxed);
        self.largest_id.fetch_max(id, AtomicOrdering::Relaxed);
    }

    /// The text of `id`, from its partition or the GUD. Numeric terms render
    /// their value.
    pub fn get_text(&self, id: u64) -> Result<Option<Vec<u8>>> {
        if is_numeric(id) {
            return Ok(Some(numeric_text(id).into_bytes()));
        }
        let part = self.partition(id);
        if let Some(pos) = part.inv.get(&id)? {
            return Ok(Some(part.sb.get(pos)?));
        }
        Ok(self.gud_idtext.get(&id).map(|e| e.value().clone()))
    }

    pub fn get_text_from_coordinates(&self, pos: u64) -> Result<Vec<u8>> {
        self.main().sb.get(pos)
    }

    /// The text of a relation id when relations live in their own id space.
    pub fn get_text_rel(&self, id: u64) -> Result<Option<Vec<u8>>> {
        if let Some(text) = self.r2s.get(&id) {
            return Ok(Some(text.clone()));
        }
        match self.r2e.get(&id) {
            | Some(e) => self.get_text(*e),
            | None => Ok(None),
        }
    }

    pub fn get_number(&self, text: &[u8]) -> Result<Option<u64>> {
        let key = text.to_vec();
        for part in self.dictionaries.iter() {
            if let Some(id) = part.dict.get(&key)? {
                return Ok(Some(id));
            }
        }
        Ok(self.gud_textid.get(&key).map(|e| *e.value()))
    }

    pub fn get_number_rel(&self, text: &[u8]) -> Option<u64> {
        self.s2r.get(text).copied()
    }

    /// Adds `text` with `id` unless it is known. Returns whether it was added
    /// and the id it now maps to.
    pub fn put_dict(&self, text: &[u8], id: u64) -> Result<(bool, u64)> {
        self.check_writable()?;
        let (added, id) = self.main().dict.insert_if_not_exists(text.to_vec(), id)?;
        if added {
            self.note_insert(id);
        }
        Ok((added, id))
    }

    /// Like [`DictMgmt::put_dict`], also storing the text and its position
    /// when the term is new.
    pub fn put_pair(&self, text: &[u8], id: u64) -> Result<(bool, u64)> {
        let (added, id) = self.put_dict(text, id)?;
        if added {
            self.put_inv_dict(text, id)?;
        }
        Ok((added, id))
    }

    /// Adds a term whose text sorts after every stored text.
    pub fn append_pair(&self, text: &[u8], id: u64) -> Result<()> {
        self.check_writable()?;
        self.main().dict.append(text.to_vec(), id)?;
        self.put_inv_dict(text, id)?;
        self.note_insert(id);
        Ok(())
    }

    /// Stores the text of `id` and indexes its position.
    pub fn put_inv_dict(&self, text: &[u8], id: u64) -> Result<u64> {
        self.check_writable()?;
        let pos = self.main().sb.append(text)?;
        self.main().inv.put(id, pos)?;
        Ok(pos)
    }

    pub fn put_inv_coordinates(&self, id: u64, pos: u64) -> Result<()> {
        self.check_writable()?;
        self.main().inv.put(id, pos)?;
        Ok(())
    }

    /// Registers a term outside the trees. Allowed on read-only knowledge
    /// bases; the GUD is written back by [`DictMgmt::flush`].
    pub fn put_in_update_dict(&self, id: u64, text: &[u8]) {
        self.gud_idtext.insert(id, text.to_vec());
        self.gud_textid.insert(text.to_vec(), id);
        self.gud_largest.fetch_max(id, AtomicOrdering::Relaxed);
        self.gud_modified.store(true, AtomicOrdering::Release);
    }

    pub fn gud_size(&self) -> usize {
        self.gud_idtext.len()
    }

    pub fn largest_gud_term(&self) -> u64 {
        self.gud_largest.load(AtomicOrdering::Relaxed)
    }

    pub fn n_rels(&self) -> usize {
        self.r2e.len() + self.r2s.len()
    }

    pub fn n_terms_inserted(&self) -> u64 {
        self.inserted.load(AtomicOrdering::Relaxed)
    }

    pub fn largest_id_inserted(&self) -> u64 {
        self.largest_id.load(AtomicOrdering::Relaxed)
    }

    pub fn dict_iter(&self) -> Result<TreeItr<'_, Vec<u8>, u64>> {
        self.main().dict.iter()
    }

    pub fn inv_dict_iter(&self) -> Result<TreeItr<'_, u64, u64>> {
        self.main().inv.iter()
    }

    pub fn string_buffer(&self) -> &StringBuffer {
        &self.main().sb
    }

    /// Persists the trees of a writable dictionary and a modified GUD.
    #[instrument(level = "debug", skip(self))]
    pub fn flush(&self) -> Result<()> {
        if !self.read_only {
            for part in self.dictionaries.iter() {
                part.flush()?;
            }
        }
        if !self.gud_modified.swap(false, AtomicOrdering::AcqRel) || self.gud_idtext.is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.gud_dir)?;
        let path = self.gud_dir.join(GUD_FILE);
        let mut out = std::io::BufWriter::new(fs::File::create(&path)?);
        writeln!(out, "{}", self.largest_gud_term())?;
        for entry in self.gud_idtext.iter() {
            out.write_all(entry.key().to_string().as_bytes())?;
            out.write_all(b"\t")?;
            out.write_all(entry.value())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        debug!(terms = self.gud_idtext.len(), path = %path.display(), "wrote global update dictionary");
        Ok(())
    }
}

// Terms are raw bytes; only the first tab separates the id.
fn split_tab(line: &[u8]) -> Option<(&[u8], &[u8])> {
    let at = line.iter().position(|&b| b == b'\t')?;
    Some((&line[..at], &line[at + 1..]))
}

fn parse_id(s: &[u8], path: &Path) -> Result<u64> {
    std::str::from_utf8(s)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            TridentError::corrupt(format!(
                "bad term id {:?} in {}",
                String::from_utf8_lossy(s),
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn cfg() -> KbConfig {
        let mut cfg = KbConfig::for_writing();
        cfg.set_tree_max_elements_node(4).set_tree_node_min_bytes(16);
        cfg
    }

    fn open(dir: &Path, cfg: &KbConfig) -> DictMgmt {
        let dict = Dict::open(&dir.join("dict"), cfg).unwrap();
        DictMgmt::open(dict, cfg.read_only(), &dir.join("_diff"), &dir.join("e2r"), &dir.join("e2s")).unwrap()
    }

    #[test]
    fn test_put_dict_is_idempotent() {
        let dir = tempdir().unwrap();
        let mgmt = open(dir.path(), &cfg());
        assert_eq!(mgmt.put_pair(b"<a>", 0).unwrap(), (true, 0));
        assert_eq!(mgmt.put_pair(b"<a>", 1).unwrap(), (false, 0));
        assert_eq!(mgmt.put_pair(b"<b>", 1).unwrap(), (true, 1));
        assert_eq!(mgmt.n_terms_inserted(), 2);
        assert_eq!(mgmt.largest_id_inserted(), 1);
        assert_eq!(mgmt.get_number(b"<b>").unwrap(), Some(1));
        assert_eq!(mgmt.get_text(0).unwrap().as_deref(), Some(&b"<a>"[..]));
        assert_eq!(mgmt.get_text(7).unwrap(), None);
    }

    #[test]
    fn test_reopen_read_only_with_gud() {
        let dir = tempdir().unwrap();
        {
            let mgmt = open(dir.path(), &cfg());
            for (i, t) in ["\"z\"", "<x>", "<y>"].iter().enumerate() {
                mgmt.append_pair(t.as_bytes(), i as u64).unwrap();
            }
            mgmt.flush().unwrap();
        }
        let mut ro = cfg();
        ro.set_read_only(true);
        {
            let mgmt = open(dir.path(), &ro);
            assert_eq!(mgmt.get_text(0).unwrap().as_deref(), Some(&b"\"z\""[..]));
            assert_eq!(mgmt.get_number(b"<y>").unwrap(), Some(2));
            assert!(mgmt.put_dict(b"<w>", 9).unwrap_err().is_misuse());
            mgmt.put_in_update_dict(100, b"<new>");
            assert_eq!(mgmt.get_number(b"<new>").unwrap(), Some(100));
            mgmt.flush().unwrap();
        }
        let mgmt = open(dir.path(), &ro);
        assert_eq!(mgmt.gud_size(), 1);
        assert_eq!(mgmt.largest_gud_term(), 100);
        assert_eq!(mgmt.get_text(100).unwrap().as_deref(), Some(&b"<new>"[..]));
    }

    #[test]
    fn test_gud_keeps_raw_bytes_across_reopen() {
        let dir = tempdir().unwrap();
        let latin1 = b"\"caf\xe9\"";
        let tabbed = b"\"a\tb\"";
        {
            let mgmt = open(dir.path(), &cfg());
            mgmt.put_in_update_dict(100, latin1);
            mgmt.put_in_update_dict(101, tabbed);
            mgmt.flush().unwrap();
        }
        let mgmt = open(dir.path(), &cfg());
        assert_eq!(mgmt.gud_size(), 2);
        assert_eq!(mgmt.largest_gud_term(), 101);
        assert_eq!(mgmt.get_text(100).unwrap().as_deref(), Some(&latin1[..]));
        assert_eq!(mgmt.get_number(latin1).unwrap(), Some(100));
        assert_eq!(mgmt.get_text(101).unwrap().as_deref(), Some(&tabbed[..]));
    }

    #[test]
    fn test_relation_maps() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("e2s"), "3\t<knows>\n4\t<likes>\n").unwrap();
        let mgmt = open(dir.path(), &cfg());
        assert_eq!(mgmt.n_rels(), 2);
        assert_eq!(mgmt.get_number_rel(b"<likes>"), Some(4));
        assert_eq!(mgmt.get_text_rel(3).unwrap().as_deref(), Some(&b"<knows>"[..]));
        assert_eq!(mgmt.get_text_rel(5).unwrap(), None);
    }

    #[test]
    fn test_numeric_terms() {
        let seven = int_term(7).unwrap();
        assert!(is_numeric(seven));
        assert_eq!(int_value(seven), 7);
        assert_eq!(numeric_text(seven), "7");
        let half = float_term(6.5);
        assert!(is_numeric(half));
        assert_eq!(float_value(half), 6.5);
        assert_eq!(compare_numeric(seven, half), Ordering::Greater);
        assert_eq!(compare_numeric(seven, int_term(9).unwrap()), Ordering::Less);
        assert!(!is_numeric(42));
        assert!(int_term(DICTMGMT_FLOAT).is_err());
    }
}
