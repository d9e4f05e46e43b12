// Copyright (c) Sienna Satterwhite, CesiumDB Contributors
// SPDX-License-Identifier: GPL-3.0-only WITH Classpath-exception-2.0

use std::sync::Arc;

use crate::{
    errs::{
        Result,
        TridentError,
    },
    itr::{
        constraint_accessors,
        AggrItr,
        ArrayItr,
        ColumnIgnorable,
        ItrKind,
        KeySeekable,
        Markable,
        PairItr,
        Seekable,
        TableItr,
        TermItr,
    },
    kb::catalog::{
        Catalog,
        NO_SESSIONS,
    },
    perm::Permutation,
    table::strategy::StorageStrat,
    tree::Coordinate,
};

/// The reader of the key currently being scanned.
#[derive(Clone)]
enum Cursor {
    Table(TableItr),
    Aggr(AggrItr),
    Reversed(ArrayItr),
}

macro_rules! on_cursor {
    ($c:expr, $t:ident => $e:expr) => {
        match &mut *$c {
            | Cursor::Table($t) => $e,
            | Cursor::Aggr($t) => $e,
            | Cursor::Reversed($t) => $e,
        }
    };
}

/// Walks every table of a permutation in key order.
///
/// When the permutation is one of the reverse orders, and may therefore have
/// skipped small tables, the keys come from the term list of its forward
/// counterpart. Keys missing from the permutation's own term list are then
/// served by reversing the forward table in memory.
#[derive(Clone)]
pub struct ScanItr {
    catalog: Arc<Catalog>,
    perm: Permutation,
    own: Option<TermItr>,
    own_key: Option<i64>,
    forward: Option<TermItr>,
    cursor: Option<Cursor>,
    cursor_key: i64,
    v1: i64,
    v2: i64,
    count: u64,
    key: i64,
    c1: Option<i64>,
    c2: Option<i64>,
    ignore: bool,
    saved: Option<Box<ScanItr>>,
}

impl ScanItr {
    pub fn new(catalog: Arc<Catalog>, perm: Permutation) -> Result<Self> {
        let own = catalog.term_list(perm, true)?;
        let forward = if perm.is_reverse() || own.is_none() {
            catalog.term_list(perm.reverse(), true)?
        } else {
            None
        };
        if own.is_none() && forward.is_none() {
            return Err(TridentError::misuse(format!("permutation {perm} is not stored")));
        }
        Ok(ScanItr {
            catalog,
            perm,
            own,
            own_key: None,
            forward,
            cursor: None,
            cursor_key: -1,
            v1: -1,
            v2: -1,
            count: 0,
            key: -1,
            c1: None,
            c2: None,
            ignore: false,
            saved: None,
        })
    }

    pub fn permutation(&self) -> Permutation {
        self.perm
    }

    fn open_stored(&self, perm: Permutation, key: i64, file: u16, mark: u64, strat: u8) -> Result<Cursor> {
        let coord = Coordinate {
            file,
            mark,
            strat,
            n_elements: 0,
        };
        let table = self.catalog.open_table(perm, key, &coord, None, None, None)?;
        if StorageStrat::from_byte(strat)?.is_aggregated() {
            return Ok(Cursor::Aggr(AggrItr::new(
                self.catalog.clone(),
                perm,
                key,
                table,
                None,
                NO_SESSIONS,
            )?));
        }
        Ok(Cursor::Table(table))
    }

    /// Opens the reader of the next key.
    fn next_cursor(&mut self) -> Result<bool> {
        let mut cursor = match self.forward.as_mut() {
            | Some(fwd) => {
                if !fwd.has_next()? {
                    return Ok(false);
                }
                fwd.next()?;
                let key = fwd.key();
                let (file, mark, strat) = location(fwd)?;
                let mut stored = false;
                if let Some(own) = self.own.as_mut() {
                    while self.own_key.map_or(true, |k| k < key) && own.has_next()? {
                        own.next()?;
                        self.own_key = Some(own.key());
                    }
                    stored = self.own_key == Some(key);
                }
                if stored {
                    let (f, m, s) = match self.own.as_ref() {
                        | Some(own) => location(own)?,
                        | None => return Err(TridentError::corrupt("scan lost its term list")),
                    };
                    self.cursor_key = key;
                    self.open_stored(self.perm, key, f, m, s)?
                } else {
                    let rev = self.perm.reverse();
                    let mut source = self.open_stored(rev, key, file, mark, strat)?;
                    self.catalog.query_stats().record_reversed();
                    self.cursor_key = key;
                    Cursor::Reversed(on_cursor!(&mut source, t => Catalog::reversed(t, key, None, None))?)
                }
            },
            | None => {
                let own = match self.own.as_mut() {
                    | Some(own) => own,
                    | None => return Ok(false),
                };
                if !own.has_next()? {
                    return Ok(false);
                }
                own.next()?;
                let key = own.key();
                let (file, mark, strat) = location(own)?;
                self.cursor_key = key;
                self.open_stored(self.perm, key, file, mark, strat)?
            },
        };
        if self.ignore {
            on_cursor!(&mut cursor, t => ColumnIgnorable::ignore_second_column(t))?;
        }
        self.cursor = Some(cursor);
        Ok(true)
    }

    fn fill(&mut self) -> Result<bool> {
        loop {
            if let Some(c) = self.cursor.as_mut() {
                if on_cursor!(c, t => t.has_next())? {
                    return Ok(true);
                }
            }
            if !self.next_cursor()? {
                self.cursor = None;
                return Ok(false);
            }
        }
    }
}

fn location(itr: &TermItr) -> Result<(u16, u64, u8)> {
    match (itr.current_file(), itr.current_mark()) {
        | (Some(f), Some(m)) => Ok((f, m, itr.current_strat())),
        | _ => Err(TridentError::misuse("term list read before next")),
    }
}

impl PairItr for ScanItr {
    constraint_accessors!();

    fn kind(&self) -> ItrKind {
        ItrKind::Scan
    }

    fn value1(&self) -> i64 {
        self.v1
    }

    fn value2(&self) -> i64 {
        self.v2
    }

    fn count(&mut self) -> Result<u64> {
        Ok(self.count)
    }

    fn has_next(&mut self) -> Result<bool> {
        self.fill()
    }

    fn next(&mut self) -> Result<()> {
        if !self.fill()? {
            return Err(TridentError::misuse("next on an exhausted scan"));
        }
        let c = self
            .cursor
            .as_mut()
            .ok_or_else(|| TridentError::corrupt("scan cursor vanished"))?;
        on_cursor!(c, t => t.next())?;
        self.v1 = on_cursor!(c, t => t.value1());
        self.v2 = on_cursor!(c, t => t.value2());
        self.count = on_cursor!(c, t => t.count())?;
        self.key = self.cursor_key;
        Ok(())
    }

    fn cardinality(&mut self) -> Result<u64> {
        Ok(if self.ignore {
            self.catalog.n_first_terms(self.perm)
        } else {
            self.catalog.n_triples()
        })
    }

    fn est_cardinality(&mut self) -> Result<u64> {
        self.cardinality()
    }

    fn is_second_column_ignored(&self) -> bool {
        self.ignore
    }

    fn as_seekable(&mut self) -> Option<&mut dyn Seekable> {
        Some(self)
    }

    fn as_key_seekable(&mut self) -> Option<&mut dyn KeySeekable> {
        Some(self)
    }

    fn as_markable(&mut self) -> Option<&mut dyn Markable> {
        Some(self)
    }

    fn as_column_ignorable(&mut self) -> Option<&mut dyn ColumnIgnorable> {
        Some(self)
    }
}

impl Seekable for ScanItr {
    /// Positions inside the current key only.
    fn moveto(&mut self, c1: i64, c2: i64) -> Result<()> {
        match self.cursor.as_mut() {
            | Some(c) => on_cursor!(c, t => Seekable::moveto(t, c1, c2)),
            | None => Ok(()),
        }
    }
}

impl KeySeekable for ScanItr {
    fn goto_key(&mut self, key: i64) -> Result<()> {
        if self.cursor.is_some() && key <= self.cursor_key {
            return Ok(());
        }
        self.cursor = None;
        if let Some(fwd) = self.forward.as_mut() {
            fwd.goto_key(key)?;
        }
        if let Some(own) = self.own.as_mut() {
            // an own key already past the target stays current
            if self.own_key.map_or(true, |k| k < key) {
                own.goto_key(key)?;
                self.own_key = None;
            }
        }
        Ok(())
    }
}

impl Markable for ScanItr {
    fn mark(&mut self) -> Result<()> {
        let mut snap = self.clone();
        snap.saved = None;
        self.saved = Some(Box::new(snap));
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        let snap = self
            .saved
            .take()
            .ok_or_else(|| TridentError::misuse("reset without a mark"))?;
        *self = (*snap).clone();
        self.saved = Some(snap);
        Ok(())
    }
}

impl ColumnIgnorable for ScanItr {
    fn ignore_second_column(&mut self) -> Result<()> {
        if self.ignore {
            return Ok(());
        }
        self.ignore = true;
        if let Some(c) = self.cursor.as_mut() {
            on_cursor!(c, t => ColumnIgnorable::ignore_second_column(t))?;
            if self.cursor_key == self.key {
                self.count = on_cursor!(c, t => t.count())?;
            }
        }
        Ok(())
    }
}
