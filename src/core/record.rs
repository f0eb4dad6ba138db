//! Records (struct/union) and enums
//!
//! Both start opaque and are filled exactly once. The record layout is
//! computed under the host model when the fields are set and never changes
//! afterwards.

use super::layout::{compute_layout, DataModel, RecordLayout};
use super::types::{CKind, TypeNode};
use crate::errors::{FfiError, Result};
use once_cell::unsync::OnceCell;
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::os::raw::c_int;
use std::rc::Rc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Field {
    /// Empty for anonymous nested members
    pub name: String,
    pub ty: TypeNode,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeNode) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn anonymous(ty: TypeNode) -> Self {
        Self::new("", ty)
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

#[derive(Debug)]
struct RecordBody {
    fields: Vec<Field>,
    layout: RecordLayout,
}

pub struct Record {
    name: String,
    is_union: bool,
    body: OnceCell<RecordBody>,
    /// Host-side data attached by the embedder, set at most once
    metadata: OnceCell<Rc<dyn Any>>,
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("name", &self.name)
            .field("is_union", &self.is_union)
            .field("body", &self.body)
            .field("metadata", &self.metadata.get().is_some())
            .finish()
    }
}

impl Record {
    /// Opaque record, fields to be set later
    pub fn new(name: impl Into<String>, is_union: bool) -> Self {
        Self {
            name: name.into(),
            is_union,
            body: OnceCell::new(),
            metadata: OnceCell::new(),
        }
    }

    pub fn with_fields(name: impl Into<String>, is_union: bool, fields: Vec<Field>) -> Result<Self> {
        let record = Self::new(name, is_union);
        record.set_fields(fields)?;
        Ok(record)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_union(&self) -> bool {
        self.is_union
    }

    pub fn is_opaque(&self) -> bool {
        self.body.get().is_none()
    }

    /// `struct foo` / `union foo`
    pub fn display_name(&self) -> String {
        let tag = if self.is_union { "union" } else { "struct" };
        format!("{} {}", tag, self.name)
    }

    pub fn set_fields(&self, fields: Vec<Field>) -> Result<()> {
        let body = self.build_body(fields)?;
        self.install(body)
    }

    /// Validate and lay out `fields` now, install them later with
    /// `RecordFill::apply`
    pub fn prepare_fill(self: &Rc<Self>, fields: Vec<Field>) -> Result<RecordFill> {
        let body = self.build_body(fields)?;
        Ok(RecordFill {
            record: Rc::clone(self),
            body,
        })
    }

    fn build_body(&self, fields: Vec<Field>) -> Result<RecordBody> {
        if !self.is_opaque() {
            return Err(FfiError::conflict(self.display_name()));
        }
        let label = self.display_name();
        let layout = compute_layout(&label, &fields, self.is_union, DataModel::host())?;
        debug!(
            record = %label,
            fields = fields.len(),
            size = layout.size,
            align = layout.align,
            "record layout computed"
        );
        Ok(RecordBody { fields, layout })
    }

    fn install(&self, body: RecordBody) -> Result<()> {
        self.body
            .set(body)
            .map_err(|_| FfiError::conflict(self.display_name()))
    }

    /// Attach host data to this type. A second attach is a conflict.
    pub fn attach_metadata(&self, meta: Rc<dyn Any>) -> Result<()> {
        self.metadata
            .set(meta)
            .map_err(|_| FfiError::conflict(format!("metadata of {}", self.display_name())))
    }

    pub fn metadata(&self) -> Option<Rc<dyn Any>> {
        self.metadata.get().cloned()
    }

    /// Declared fields; empty while opaque
    pub fn fields(&self) -> &[Field] {
        self.body.get().map_or(&[], |b| b.fields.as_slice())
    }

    pub fn layout(&self) -> Result<&RecordLayout> {
        self.body
            .get()
            .map(|b| &b.layout)
            .ok_or_else(|| FfiError::incomplete(self.display_name()))
    }

    /// Layout under `model`; the host layout is served from the cache
    pub fn layout_in(&self, model: &DataModel) -> Result<Cow<'_, RecordLayout>> {
        let body = self
            .body
            .get()
            .ok_or_else(|| FfiError::incomplete(self.display_name()))?;
        if model.is_host() {
            return Ok(Cow::Borrowed(&body.layout));
        }
        compute_layout(&self.display_name(), &body.fields, self.is_union, model).map(Cow::Owned)
    }

    pub fn alloc_size(&self) -> Result<usize> {
        self.layout().map(|l| l.size)
    }

    /// Last member is an unbounded array, directly or through a nested record
    pub fn is_flexible(&self) -> bool {
        match self.fields().last() {
            Some(last) if last.ty.is_unbounded() => true,
            Some(last) if last.ty.kind() == CKind::Record => {
                last.ty.record().map_or(false, |r| r.is_flexible())
            }
            _ => false,
        }
    }

    /// Only complete, non-union, fixed-size records with passable members
    /// can travel by value through a foreign call.
    pub fn passable(&self) -> bool {
        !self.is_opaque()
            && !self.is_union
            && !self.is_flexible()
            && self.fields().iter().all(|f| field_passable(&f.ty))
    }

    /// Offset and type of a member, searching anonymous nested records
    pub fn field_offset(&self, name: &str) -> Option<(usize, TypeNode)> {
        let layout = self.layout().ok()?;
        for (field, slot) in self.fields().iter().zip(&layout.fields) {
            if field.name == name {
                return Some((slot.offset, field.ty.clone()));
            }
            if field.is_anonymous() {
                if let Some(nested) = field.ty.record() {
                    if let Some((offset, ty)) = nested.field_offset(name) {
                        return Some((slot.offset + offset, ty));
                    }
                }
            }
        }
        None
    }
}

/// A validated field list waiting to be installed into an opaque record
#[derive(Debug)]
pub struct RecordFill {
    record: Rc<Record>,
    body: RecordBody,
}

impl RecordFill {
    pub fn record(&self) -> &Rc<Record> {
        &self.record
    }

    /// Fails only if the record was completed some other way meanwhile
    pub fn apply(self) -> Result<()> {
        self.record.install(self.body)
    }
}

fn field_passable(ty: &TypeNode) -> bool {
    match ty.kind() {
        CKind::Array => !ty.is_unbounded() && !ty.is_vla() && ty.pointee().map_or(false, field_passable),
        _ => ty.passable(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumField {
    pub name: String,
    pub value: i64,
}

impl EnumField {
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug)]
pub struct EnumType {
    name: String,
    body: OnceCell<Vec<EnumField>>,
}

impl EnumType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: OnceCell::new(),
        }
    }

    pub fn with_fields(name: impl Into<String>, fields: Vec<EnumField>) -> Result<Self> {
        let e = Self::new(name);
        e.set_fields(fields)?;
        Ok(e)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn display_name(&self) -> String {
        format!("enum {}", self.name)
    }

    pub fn is_opaque(&self) -> bool {
        self.body.get().is_none()
    }

    /// Values are stored as C `int`
    pub fn set_fields(&self, fields: Vec<EnumField>) -> Result<()> {
        if !self.is_opaque() {
            return Err(FfiError::conflict(self.display_name()));
        }
        if let Some(bad) = fields
            .iter()
            .find(|f| f.value < c_int::MIN as i64 || f.value > c_int::MAX as i64)
        {
            return Err(FfiError::invalid_declaration(
                self.display_name(),
                format!("value of '{}' does not fit in int", bad.name),
            ));
        }
        self.body
            .set(fields)
            .map_err(|_| FfiError::conflict(self.display_name()))
    }

    pub fn fields(&self) -> &[EnumField] {
        self.body.get().map_or(&[], Vec::as_slice)
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.fields().iter().find(|f| f.name == name).map(|f| f.value)
    }

    /// First constant with this value
    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.fields()
            .iter()
            .find(|f| f.value == value)
            .map(|f| f.name.as_str())
    }
}
