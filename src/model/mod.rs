mod collection;
mod field;
mod schema;
mod value;

#[cfg(test)]
pub(crate) mod fixtures;

pub use collection::*;
pub use field::*;
pub use schema::*;
pub use value::*;

pub(crate) use value::parse_timestamp;
