//! Declaration registry with staged scopes
//!
//! A parsed batch goes into a `StagedStore` chained to the session's root
//! store. `commit` consumes the stage and merges it; dropping it without a
//! commit throws the whole batch away. Completing an opaque record that is
//! already shared goes through `fill_record`, so it is deferred the same way.

use super::Declaration;
use crate::core::{Field, Record, RecordFill};
use crate::errors::{FfiError, Result};
use crate::logging;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct DeclarationStore {
    decls: Vec<Declaration>,
    index: HashMap<String, usize>,
    anon_seq: usize,
}

impl DeclarationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Declaration> {
        self.decls.iter()
    }

    pub fn lookup(&self, name: &str) -> Option<&Declaration> {
        self.index.get(name).map(|&i| &self.decls[i])
    }

    /// Add directly to the root scope
    pub fn add(&mut self, decl: Declaration) -> Result<()> {
        if let Some(name) = decl.name() {
            if let Some(existing) = self.lookup(&name) {
                if check_redeclaration(existing, &decl, &name)? {
                    return Ok(());
                }
            }
        }
        self.insert(decl);
        Ok(())
    }

    /// Open a staged scope on top of this store
    pub fn stage(&mut self) -> StagedStore<'_> {
        StagedStore {
            base: self,
            local: DeclarationStore::new(),
            fills: Vec::new(),
            committed: false,
        }
    }

    /// Fresh name for an anonymous record or enum
    pub fn request_name(&mut self) -> String {
        self.anon_seq += 1;
        anonymous_name(self.anon_seq)
    }

    fn insert(&mut self, decl: Declaration) {
        let slot = self.decls.len();
        if let Some(name) = decl.name() {
            self.index.insert(name.into_owned(), slot);
        }
        self.decls.push(decl);
    }
}

fn anonymous_name(seq: usize) -> String {
    format!("anonymous#{}", seq)
}

/// Decide whether `new` may coexist with `existing` under `name`.
/// `Ok(true)` means it is already present and nothing needs adding.
fn check_redeclaration(existing: &Declaration, new: &Declaration, name: &str) -> Result<bool> {
    if existing.is_same(new) {
        return Ok(true);
    }
    match (existing, new) {
        // forward declaration of something already declared
        (Declaration::Record(old), Declaration::Record(fwd))
            if fwd.is_opaque() && old.is_union() == fwd.is_union() =>
        {
            Ok(true)
        }
        (Declaration::Enum(_), Declaration::Enum(fwd)) if fwd.is_opaque() => Ok(true),
        _ => Err(FfiError::conflict(name)),
    }
}

pub struct StagedStore<'a> {
    base: &'a mut DeclarationStore,
    local: DeclarationStore,
    fills: Vec<RecordFill>,
    committed: bool,
}

impl<'a> StagedStore<'a> {
    pub fn add(&mut self, decl: Declaration) -> Result<()> {
        if let Some(name) = decl.name() {
            if let Some(existing) = self.lookup(&name) {
                if check_redeclaration(existing, &decl, &name)? {
                    return Ok(());
                }
            }
        }
        self.local.insert(decl);
        Ok(())
    }

    /// Complete an opaque record on commit. The fields are validated and
    /// laid out now; the record stays opaque until the batch commits.
    pub fn fill_record(&mut self, record: &Rc<Record>, fields: Vec<Field>) -> Result<()> {
        if self.fills.iter().any(|f| Rc::ptr_eq(f.record(), record)) {
            return Err(FfiError::conflict(record.display_name()));
        }
        let fill = record.prepare_fill(fields)?;
        self.fills.push(fill);
        Ok(())
    }

    /// Staged declarations first, then the base scope
    pub fn lookup(&self, name: &str) -> Option<&Declaration> {
        self.local.lookup(name).or_else(|| self.base.lookup(name))
    }

    pub fn request_name(&mut self) -> String {
        self.local.anon_seq += 1;
        anonymous_name(self.base.anon_seq + self.local.anon_seq)
    }

    pub fn staged(&self) -> usize {
        self.local.len() + self.fills.len()
    }

    pub fn commit(mut self) {
        let count = self.staged();
        for fill in std::mem::take(&mut self.fills) {
            let name = fill.record().display_name();
            if let Err(err) = fill.apply() {
                logging::log_fill_skipped(&name, &err.to_string());
            }
        }
        for decl in std::mem::take(&mut self.local.decls) {
            self.base.insert(decl);
        }
        self.base.anon_seq += self.local.anon_seq;
        self.committed = true;
        logging::log_scope_commit(count);
    }
}

impl Drop for StagedStore<'_> {
    fn drop(&mut self) {
        if !self.committed && self.staged() > 0 {
            logging::log_scope_discard(self.staged());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CKind, Field, Record, TypeNode};
    use crate::errors::ErrorKind;

    fn int() -> TypeNode {
        TypeNode::builtin(CKind::Int)
    }

    #[test]
    fn test_commit_merges() {
        let mut store = DeclarationStore::new();
        {
            let mut stage = store.stage();
            stage.add(Declaration::variable("a", int())).unwrap();
            assert!(stage.lookup("a").is_some());
            stage.commit();
        }
        assert!(store.lookup("a").is_some());
    }

    #[test]
    fn test_drop_discards() {
        let mut store = DeclarationStore::new();
        {
            let mut stage = store.stage();
            stage.add(Declaration::variable("a", int())).unwrap();
        }
        assert!(store.lookup("a").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_conflict_against_base() {
        let mut store = DeclarationStore::new();
        store.add(Declaration::variable("x", int())).unwrap();
        let mut stage = store.stage();
        let err = stage
            .add(Declaration::variable("x", TypeNode::builtin(CKind::Double)))
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DeclarationConflict { .. }));
        // identical redeclaration is a no-op
        stage.add(Declaration::variable("x", int())).unwrap();
        assert_eq!(stage.staged(), 0);
    }

    #[test]
    fn test_forward_declaration_is_noop() {
        let mut store = DeclarationStore::new();
        let rec = Rc::new(Record::with_fields("s", false, vec![Field::new("a", int())]).unwrap());
        store.add(Declaration::Record(rec.clone())).unwrap();
        store
            .add(Declaration::Record(Rc::new(Record::new("s", false))))
            .unwrap();
        match store.lookup("struct s") {
            Some(Declaration::Record(found)) => assert!(Rc::ptr_eq(found, &rec)),
            other => panic!("unexpected {:?}", other),
        }
        // a different complete definition conflicts
        let other = Rc::new(Record::with_fields("s", false, vec![Field::new("b", int())]).unwrap());
        assert!(store.add(Declaration::Record(other)).is_err());
    }

    #[test]
    fn test_record_fill_waits_for_commit() {
        let mut store = DeclarationStore::new();
        let fwd = Rc::new(Record::new("node", false));
        store.add(Declaration::Record(fwd.clone())).unwrap();

        {
            let mut stage = store.stage();
            stage.fill_record(&fwd, vec![Field::new("a", int())]).unwrap();
            assert!(fwd.is_opaque());
            // dropped without commit
        }
        assert!(fwd.is_opaque());

        let mut stage = store.stage();
        stage.fill_record(&fwd, vec![Field::new("a", int())]).unwrap();
        let err = stage
            .fill_record(&fwd, vec![Field::new("b", int())])
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DeclarationConflict { .. }));
        assert_eq!(stage.staged(), 1);
        stage.commit();
        assert_eq!(fwd.fields().len(), 1);
        assert_eq!(fwd.alloc_size().unwrap(), 4);
    }

    #[test]
    fn test_request_name_unique_across_chain() {
        let mut store = DeclarationStore::new();
        let first = store.request_name();
        let mut stage = store.stage();
        let second = stage.request_name();
        let third = stage.request_name();
        assert_ne!(first, second);
        assert_ne!(second, third);
        stage.commit();
        let fourth = store.request_name();
        assert_ne!(fourth, third);
    }
}
