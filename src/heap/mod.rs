/*
 * SPDX-FileCopyrightText: 2024 Inria
 * SPDX-FileCopyrightText: 2024 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The contract between the analysis engines and an HPROF reader.
//!
//! The binary parser itself lives outside this crate: whatever reads the
//! dump implements [`HeapSource`], handing the engines class definitions
//! with field layouts, instances with their dump file offsets and shallow
//! sizes, per-instance outgoing references, and the GC-root set. The
//! engines never see the dump bytes.

mod vec_heap;
pub use vec_heap::*;

use anyhow::Result;

/// Opaque 64-bit identifier from the dump (a pointer in the original
/// process). Not dense; 0 is the null identifier.
pub type ObjectId = u64;

/// Identifier of a class definition. In HPROF dumps this coincides with the
/// [`ObjectId`] of the class object.
pub type ClassId = u64;

/// Dense 32-bit object numbering assigned at parse time, in discovery
/// order. Index 0 is the null sentinel.
pub type ObjectIndex = u32;

/// Pointer width of the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSize {
    /// 32-bit identifiers.
    Four,
    /// 64-bit identifiers.
    Eight,
}

impl IdSize {
    /// The width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            IdSize::Four => 4,
            IdSize::Eight => 8,
        }
    }
}

/// The kind of a heap object.
///
/// The analysis dispatches on this tag instead of a class hierarchy: an
/// object is an instance, an array of references, an array of primitives,
/// or a class object carrying static fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A plain instance with object and primitive fields.
    Instance,
    /// An array of references.
    ObjectArray,
    /// An array of primitives; never holds outgoing references.
    PrimitiveArray,
    /// A class object; its outgoing references are its static fields.
    Class,
}

/// One heap object as reported by the dump reader.
#[derive(Debug, Clone, Copy)]
pub struct ObjectInfo {
    /// Identifier from the dump; never 0.
    pub object_id: ObjectId,
    /// The object's class.
    pub class_id: ClassId,
    /// Location in the dump where the instance payload begins; never 0.
    pub file_offset: u64,
    /// In-dump size of this single object.
    pub shallow_size: u64,
    /// Variant tag.
    pub kind: ObjectKind,
}

/// One instance field of a class.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Field name as recorded in the dump.
    pub name: String,
    /// Whether the field holds an object reference (as opposed to a
    /// primitive value).
    pub is_object: bool,
}

/// One class definition.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    /// Identifier of the class (and of its class object).
    pub class_id: ClassId,
    /// Fully qualified name, dotted or slashed as the dump records it.
    pub name: String,
    /// Superclass identifier, or 0 for `java.lang.Object` and primitives.
    pub super_class_id: ClassId,
    /// Instance fields declared by this class (superclass fields excluded).
    pub fields: Vec<FieldInfo>,
}

/// How an outgoing reference is held by its source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind<'a> {
    /// An instance field, with its declared name.
    Field(&'a str),
    /// A static field of a class object.
    Static,
    /// An element of an object array.
    Element,
}

/// One outgoing reference.
#[derive(Debug, Clone, Copy)]
pub struct Reference<'a> {
    /// The referenced object.
    pub target: ObjectId,
    /// How the reference is held.
    pub kind: ReferenceKind<'a>,
}

/// Read access to a parsed heap dump.
///
/// File offsets identify objects across calls; they are nonzero and stable
/// for the lifetime of the source. Iteration order of
/// [`for_each_object`](HeapSource::for_each_object) defines the dense
/// [`ObjectIndex`] assignment.
pub trait HeapSource {
    /// The dump's pointer width.
    fn id_size(&self) -> IdSize;

    /// Calls `f` once per heap object, in discovery order.
    fn for_each_object(&self, f: &mut dyn FnMut(&ObjectInfo) -> Result<()>) -> Result<()>;

    /// Resolves the object whose payload begins at `file_offset`.
    ///
    /// Fails with [`Error::MalformedDump`](crate::Error::MalformedDump) if
    /// no object lives there.
    fn object_at(&self, file_offset: u64) -> Result<ObjectInfo>;

    /// Calls `f` once per outgoing reference of the object at
    /// `file_offset`: object fields for instances, elements for object
    /// arrays, static fields for class objects. Primitive arrays report
    /// nothing. The `referent` field of soft/weak/phantom references IS
    /// reported; the traversal engine decides whether to follow it.
    fn for_each_reference(
        &self,
        file_offset: u64,
        f: &mut dyn FnMut(Reference<'_>) -> Result<()>,
    ) -> Result<()>;

    /// Calls `f` once per class definition.
    fn for_each_class(&self, f: &mut dyn FnMut(&ClassInfo) -> Result<()>) -> Result<()>;

    /// Looks up a class definition.
    fn class_info(&self, class_id: ClassId) -> Option<&ClassInfo>;

    /// The GC-root set. May contain duplicates and identifiers of objects
    /// missing from the dump; both are tolerated.
    fn gc_roots(&self) -> Vec<ObjectId>;

    /// A hint for sizing the object table, if the reader knows the object
    /// count up front.
    fn object_count_hint(&self) -> Option<u32> {
        None
    }
}
