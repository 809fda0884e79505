//! Models shared by the unit tests.
use chrono::{DateTime, Utc};
use std::sync::OnceLock;

use super::{Field, FieldType, Model, ModelSchema, Record};
use crate::error::Result;
use crate::lazy::{LazyField, Loader};

#[derive(Debug, Clone)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
    pub posts: LazyField<Vec<Post>>,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            posts: LazyField::detached(),
        }
    }
}

impl Model for User {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::new(
                "User",
                vec![
                    Field::new("id", FieldType::Int).key().auto(),
                    Field::new("name", FieldType::Text),
                ],
            )
        })
    }

    fn to_record(&self) -> Record {
        Record::new().with("id", self.id).with("name", &self.name)
    }

    fn from_record(record: &Record, loader: &Loader) -> Result<Self> {
        Ok(Self {
            id: record.read("id")?,
            name: record.read("name")?,
            posts: loader.every_related::<User, Post>(record),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Post {
    pub id: Option<i64>,
    pub title: String,
    pub author_id: i64,
    pub author: LazyField<Option<User>>,
    pub tags: LazyField<Vec<Tag>>,
}

impl Post {
    pub fn new(title: &str, author_id: i64) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            author_id,
            author: LazyField::detached(),
            tags: LazyField::detached(),
        }
    }
}

impl Model for Post {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::new(
                "Post",
                vec![
                    Field::new("id", FieldType::Int).key().auto(),
                    Field::new("title", FieldType::Text),
                    Field::new("author_id", FieldType::Int).references(User::schema, "id"),
                ],
            )
        })
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("title", &self.title)
            .with("author_id", self.author_id)
    }

    fn from_record(record: &Record, loader: &Loader) -> Result<Self> {
        Ok(Self {
            id: record.read("id")?,
            title: record.read("title")?,
            author_id: record.read("author_id")?,
            author: loader.the_related::<Post, User>(record),
            tags: loader.associated::<Post, PostTag, Tag>(record),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: Option<i64>,
    pub name: String,
}

impl Tag {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl Model for Tag {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::new(
                "Tag",
                vec![
                    Field::new("id", FieldType::Int).key().auto(),
                    Field::new("name", FieldType::Text),
                ],
            )
        })
    }

    fn to_record(&self) -> Record {
        Record::new().with("id", self.id).with("name", &self.name)
    }

    fn from_record(record: &Record, _loader: &Loader) -> Result<Self> {
        Ok(Self {
            id: record.read("id")?,
            name: record.read("name")?,
        })
    }
}

/// Association between posts and tags.
#[derive(Debug, Clone, PartialEq)]
pub struct PostTag {
    pub post_id: i64,
    pub tag_id: i64,
}

impl Model for PostTag {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::new(
                "PostTag",
                vec![
                    Field::new("post_id", FieldType::Int)
                        .key()
                        .references(Post::schema, "id"),
                    Field::new("tag_id", FieldType::Int)
                        .key()
                        .references(Tag::schema, "id"),
                ],
            )
        })
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("post_id", self.post_id)
            .with("tag_id", self.tag_id)
    }

    fn from_record(record: &Record, _loader: &Loader) -> Result<Self> {
        Ok(Self {
            post_id: record.read("post_id")?,
            tag_id: record.read("tag_id")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub id: Option<i64>,
    pub name: String,
    pub position: Option<i64>,
}

impl Item {
    pub fn new(name: &str, position: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            position,
        }
    }
}

impl Model for Item {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::new(
                "Item",
                vec![
                    Field::new("id", FieldType::Int).key().auto(),
                    Field::new("name", FieldType::Text),
                    Field::new("position", FieldType::Int).optional(),
                ],
            )
        })
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("name", &self.name)
            .with("position", self.position)
    }

    fn from_record(record: &Record, _loader: &Loader) -> Result<Self> {
        Ok(Self {
            id: record.read("id")?,
            name: record.read("name")?,
            position: record.read("position")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: Option<i64>,
    pub category: String,
    pub price: i64,
    pub in_stock: bool,
}

impl Product {
    pub fn new(category: &str, price: i64, in_stock: bool) -> Self {
        Self {
            id: None,
            category: category.to_string(),
            price,
            in_stock,
        }
    }
}

impl Model for Product {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::new(
                "Product",
                vec![
                    Field::new("id", FieldType::Int).key().auto(),
                    Field::new("category", FieldType::Text),
                    Field::new("price", FieldType::Int),
                    Field::new("in_stock", FieldType::Bool),
                ],
            )
        })
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("category", &self.category)
            .with("price", self.price)
            .with("in_stock", self.in_stock)
    }

    fn from_record(record: &Record, _loader: &Loader) -> Result<Self> {
        Ok(Self {
            id: record.read("id")?,
            category: record.read("category")?,
            price: record.read("price")?,
            in_stock: record.read("in_stock")?,
        })
    }
}

/// One field of every scalar type, plus a renamed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: Option<i64>,
    pub ratio: f64,
    pub payload: Vec<u8>,
    pub taken_at: DateTime<Utc>,
    pub active: bool,
    /// Stored in a column named `order`.
    pub rank: Option<String>,
}

impl Model for Sample {
    fn schema() -> &'static ModelSchema {
        static SCHEMA: OnceLock<ModelSchema> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            ModelSchema::new(
                "Sample",
                vec![
                    Field::new("id", FieldType::Int).key().auto(),
                    Field::new("ratio", FieldType::Float),
                    Field::new("payload", FieldType::Bytes),
                    Field::new("taken_at", FieldType::Timestamp),
                    Field::new("active", FieldType::Bool),
                    Field::new("rank", FieldType::Text).store_as("order").optional(),
                ],
            )
        })
    }

    fn to_record(&self) -> Record {
        Record::new()
            .with("id", self.id)
            .with("ratio", self.ratio)
            .with("payload", self.payload.clone())
            .with("taken_at", self.taken_at)
            .with("active", self.active)
            .with("rank", self.rank.clone())
    }

    fn from_record(record: &Record, _loader: &Loader) -> Result<Self> {
        Ok(Self {
            id: record.read("id")?,
            ratio: record.read("ratio")?,
            payload: record.read("payload")?,
            taken_at: record.read("taken_at")?,
            active: record.read("active")?,
            rank: record.read("rank")?,
        })
    }
}
