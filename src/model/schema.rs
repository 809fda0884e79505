use super::field::Field;
use super::value::Record;
use crate::ast::FieldRef;
use crate::error::Result;
use crate::lazy::Loader;

/// Storage description of one model type.
///
/// Table and collection names are the model name; column names are field
/// names unless a field carries a `StoreAs` alias.
#[derive(Debug)]
pub struct ModelSchema {
    name: &'static str,
    fields: Vec<Field>,
}

impl ModelSchema {
    pub fn new(name: &'static str, fields: Vec<Field>) -> Self {
        Self { name, fields }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn table(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.column() == column)
    }

    pub fn key_fields(&self) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.is_key()).collect()
    }

    /// The field holding a reference onto `target`, if any.
    pub fn reference_to(&self, target: &ModelSchema) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.reference().is_some_and(|r| r.points_to(target)))
    }

    pub fn field_ref(&self, name: &'static str) -> FieldRef {
        FieldRef::new(self.name, name)
    }
}

/// A type that can be stored and loaded through a driver.
///
/// `from_record` receives a [`Loader`] so relationship fields can be wired
/// up as lazy fields bound to the same driver the record came from.
pub trait Model: Sized + Send + Sync + 'static {
    fn schema() -> &'static ModelSchema;

    fn to_record(&self) -> Record;

    fn from_record(record: &Record, loader: &Loader) -> Result<Self>;

    fn field(name: &'static str) -> FieldRef {
        Self::schema().field_ref(name)
    }
}
