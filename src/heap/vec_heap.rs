/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! An in-memory [`HeapSource`] built object by object.
//!
//! `VecHeap` plays the role a vector-backed graph plays for graph
//! algorithms: a small, fully materialized source for tests, examples, and
//! synthetic heaps. File offsets are fabricated (16 bytes apart, starting
//! at 16) so the offset-keyed engine machinery is exercised exactly as with
//! a real dump.
//!
//! The class `java.lang.ref.Reference` is registered on construction, since
//! the traversal engine refuses to run on a dump without it; build weak
//! references by subclassing [`VecHeap::reference_class`] and adding a
//! `referent` field reference.

use super::*;
use crate::Error;
use anyhow::Result;
use std::collections::HashMap;

enum OwnedRefKind {
    Field(String),
    Static,
    Element,
}

struct OwnedRef {
    target: ObjectId,
    kind: OwnedRefKind,
}

struct HeapObject {
    info: ObjectInfo,
    refs: Vec<OwnedRef>,
}

/// In-memory heap built with `add_*` methods.
pub struct VecHeap {
    id_size: IdSize,
    objects: Vec<HeapObject>,
    by_id: HashMap<ObjectId, usize>,
    by_offset: HashMap<u64, usize>,
    classes: HashMap<ClassId, ClassInfo>,
    class_order: Vec<ClassId>,
    roots: Vec<ObjectId>,
    reference_class: ClassId,
}

/// Class identifier reserved for the built-in `java.lang.ref.Reference`.
const REFERENCE_CLASS_ID: ClassId = u64::MAX - 1;

impl VecHeap {
    /// Creates an empty heap with the given pointer width.
    pub fn new(id_size: IdSize) -> Self {
        let mut heap = Self {
            id_size,
            objects: Vec::new(),
            by_id: HashMap::new(),
            by_offset: HashMap::new(),
            classes: HashMap::new(),
            class_order: Vec::new(),
            roots: Vec::new(),
            reference_class: REFERENCE_CLASS_ID,
        };
        heap.add_class(
            REFERENCE_CLASS_ID,
            "java.lang.ref.Reference",
            0,
            &[("referent", true)],
        );
        heap
    }

    /// The built-in `java.lang.ref.Reference` class; use it as a superclass
    /// for soft/weak/phantom reference classes.
    pub fn reference_class(&self) -> ClassId {
        self.reference_class
    }

    /// Registers a class. `fields` lists declared instance fields as
    /// `(name, is_object)` pairs. Returns `class_id` for chaining.
    pub fn add_class(
        &mut self,
        class_id: ClassId,
        name: &str,
        super_class_id: ClassId,
        fields: &[(&str, bool)],
    ) -> ClassId {
        assert!(
            !self.classes.contains_key(&class_id),
            "duplicate class {:#x}",
            class_id
        );
        self.classes.insert(
            class_id,
            ClassInfo {
                class_id,
                name: name.to_string(),
                super_class_id,
                fields: fields
                    .iter()
                    .map(|(name, is_object)| FieldInfo {
                        name: name.to_string(),
                        is_object: *is_object,
                    })
                    .collect(),
            },
        );
        self.class_order.push(class_id);
        class_id
    }

    /// Adds an object with a fabricated file offset. Returns `object_id`
    /// for chaining.
    pub fn add_object(
        &mut self,
        object_id: ObjectId,
        class_id: ClassId,
        shallow_size: u64,
        kind: ObjectKind,
    ) -> ObjectId {
        assert!(object_id != 0, "object id 0 is reserved");
        assert!(
            !self.by_id.contains_key(&object_id),
            "duplicate object {:#x}",
            object_id
        );
        let file_offset = (self.objects.len() as u64 + 1) * 16;
        let slot = self.objects.len();
        self.objects.push(HeapObject {
            info: ObjectInfo {
                object_id,
                class_id,
                file_offset,
                shallow_size,
                kind,
            },
            refs: Vec::new(),
        });
        self.by_id.insert(object_id, slot);
        self.by_offset.insert(file_offset, slot);
        object_id
    }

    fn slot_mut(&mut self, object_id: ObjectId) -> &mut HeapObject {
        let slot = *self
            .by_id
            .get(&object_id)
            .unwrap_or_else(|| panic!("unknown object {:#x}", object_id));
        &mut self.objects[slot]
    }

    /// Adds an outgoing reference; object arrays get element references,
    /// everything else a field reference with a synthesized name.
    pub fn add_ref(&mut self, from: ObjectId, to: ObjectId) {
        let object = self.slot_mut(from);
        let kind = match object.info.kind {
            ObjectKind::ObjectArray => OwnedRefKind::Element,
            ObjectKind::Class => OwnedRefKind::Static,
            _ => OwnedRefKind::Field(format!("f{}", object.refs.len())),
        };
        object.refs.push(OwnedRef { target: to, kind });
    }

    /// Adds a named field reference; use the name `referent` on a
    /// [`Reference`](VecHeap::reference_class) subclass instance to model a
    /// weak referent edge.
    pub fn add_field_ref(&mut self, from: ObjectId, to: ObjectId, name: &str) {
        let reference = OwnedRef {
            target: to,
            kind: OwnedRefKind::Field(name.to_string()),
        };
        self.slot_mut(from).refs.push(reference);
    }

    /// Adds a static-field reference from a class object.
    pub fn add_static_ref(&mut self, from: ObjectId, to: ObjectId) {
        let reference = OwnedRef {
            target: to,
            kind: OwnedRefKind::Static,
        };
        self.slot_mut(from).refs.push(reference);
    }

    /// Marks an object as a GC root.
    pub fn add_root(&mut self, object_id: ObjectId) {
        self.roots.push(object_id);
    }
}

impl HeapSource for VecHeap {
    fn id_size(&self) -> IdSize {
        self.id_size
    }

    fn for_each_object(&self, f: &mut dyn FnMut(&ObjectInfo) -> Result<()>) -> Result<()> {
        for object in &self.objects {
            f(&object.info)?;
        }
        Ok(())
    }

    fn object_at(&self, file_offset: u64) -> Result<ObjectInfo> {
        match self.by_offset.get(&file_offset) {
            Some(&slot) => Ok(self.objects[slot].info),
            None => Err(Error::MalformedDump(format!(
                "no object at file offset {}",
                file_offset
            ))
            .into()),
        }
    }

    fn for_each_reference(
        &self,
        file_offset: u64,
        f: &mut dyn FnMut(Reference<'_>) -> Result<()>,
    ) -> Result<()> {
        let slot = match self.by_offset.get(&file_offset) {
            Some(&slot) => slot,
            None => {
                return Err(Error::MalformedDump(format!(
                    "no object at file offset {}",
                    file_offset
                ))
                .into())
            }
        };
        for reference in &self.objects[slot].refs {
            let kind = match &reference.kind {
                OwnedRefKind::Field(name) => ReferenceKind::Field(name),
                OwnedRefKind::Static => ReferenceKind::Static,
                OwnedRefKind::Element => ReferenceKind::Element,
            };
            f(Reference {
                target: reference.target,
                kind,
            })?;
        }
        Ok(())
    }

    fn for_each_class(&self, f: &mut dyn FnMut(&ClassInfo) -> Result<()>) -> Result<()> {
        for class_id in &self.class_order {
            f(&self.classes[class_id])?;
        }
        Ok(())
    }

    fn class_info(&self, class_id: ClassId) -> Option<&ClassInfo> {
        self.classes.get(&class_id)
    }

    fn gc_roots(&self) -> Vec<ObjectId> {
        self.roots.clone()
    }

    fn object_count_hint(&self) -> Option<u32> {
        Some(self.objects.len() as u32)
    }
}
