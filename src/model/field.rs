use std::fmt;

use super::schema::ModelSchema;

/// Declared scalar type of a model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Float,
    Text,
    Bool,
    Bytes,
    Timestamp,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Int => write!(f, "int"),
            FieldType::Float => write!(f, "float"),
            FieldType::Text => write!(f, "text"),
            FieldType::Bool => write!(f, "bool"),
            FieldType::Bytes => write!(f, "bytes"),
            FieldType::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// Metadata annotations a model description provider can attach to a field.
#[derive(Debug, Clone)]
pub enum FieldMeta {
    /// Part of the primary key.
    Key,
    /// Generated by the backend on insert.
    Auto,
    /// Stored under a different column name.
    StoreAs(&'static str),
    /// Nullable at the storage layer.
    Optional,
    /// Foreign key onto another model's field.
    ReferenceTo(Reference),
    /// Anything else; ignored.
    Unknown(String),
}

/// Target of a foreign-key field.
#[derive(Clone, Copy)]
pub struct Reference {
    model: fn() -> &'static ModelSchema,
    field: &'static str,
}

impl Reference {
    pub fn new(model: fn() -> &'static ModelSchema, field: &'static str) -> Self {
        Self { model, field }
    }

    pub fn model(&self) -> &'static ModelSchema {
        (self.model)()
    }

    pub fn field(&self) -> &'static str {
        self.field
    }

    pub fn points_to(&self, schema: &ModelSchema) -> bool {
        self.model().name() == schema.name()
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reference({}.{})", self.model().name(), self.field)
    }
}

/// One model field with its metadata resolved.
#[derive(Debug, Clone)]
pub struct Field {
    name: &'static str,
    ty: FieldType,
    column: &'static str,
    key: bool,
    auto: bool,
    optional: bool,
    reference: Option<Reference>,
}

impl Field {
    pub fn new(name: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            ty,
            column: name,
            key: false,
            auto: false,
            optional: false,
            reference: None,
        }
    }

    /// Build a field from a raw metadata list.
    pub fn from_metadata(
        name: &'static str,
        ty: FieldType,
        metadata: impl IntoIterator<Item = FieldMeta>,
    ) -> Self {
        metadata
            .into_iter()
            .fold(Self::new(name, ty), |field, meta| field.annotate(meta))
    }

    pub fn annotate(mut self, meta: FieldMeta) -> Self {
        match meta {
            FieldMeta::Key => self.key = true,
            FieldMeta::Auto => self.auto = true,
            FieldMeta::StoreAs(column) => self.column = column,
            FieldMeta::Optional => self.optional = true,
            FieldMeta::ReferenceTo(reference) => self.reference = Some(reference),
            FieldMeta::Unknown(_) => {}
        }
        self
    }

    pub fn key(self) -> Self {
        self.annotate(FieldMeta::Key)
    }

    pub fn auto(self) -> Self {
        self.annotate(FieldMeta::Auto)
    }

    pub fn store_as(self, column: &'static str) -> Self {
        self.annotate(FieldMeta::StoreAs(column))
    }

    pub fn optional(self) -> Self {
        self.annotate(FieldMeta::Optional)
    }

    pub fn references(self, model: fn() -> &'static ModelSchema, field: &'static str) -> Self {
        self.annotate(FieldMeta::ReferenceTo(Reference::new(model, field)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn ty(&self) -> FieldType {
        self.ty
    }

    /// Storage-level name.
    pub fn column(&self) -> &'static str {
        self.column
    }

    pub fn is_key(&self) -> bool {
        self.key
    }

    pub fn is_auto(&self) -> bool {
        self.auto
    }

    pub fn is_optional(&self) -> bool {
        self.optional
    }

    pub fn reference(&self) -> Option<&Reference> {
        self.reference.as_ref()
    }
}
