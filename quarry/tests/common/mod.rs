#![allow(dead_code)]

use futures_util::{FutureExt, future::BoxFuture};
use quarry::{
    Config, Connection, Error, FieldType, HydrationContext, MemoryDriver, Model, Result, Schema,
    SchemaPath, ValidationContext, Validator,
    bson::{Bson, Document, doc, oid::ObjectId},
};
use serde::Deserialize;
use std::sync::{Arc, LazyLock};

#[derive(Debug, Deserialize, PartialEq)]
pub struct Person {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub age: Option<i32>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub password: Option<String>,
}

impl Model for Person {
    const COLLECTION_NAME: &'static str = "people";

    fn schema() -> &'static Schema {
        static SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
            Schema::new("Person")
                .path("_id", FieldType::ObjectId)
                .with_path("name", SchemaPath::new(FieldType::String).required())
                .with_path("age", SchemaPath::new(FieldType::Number).min(0.0).max(150.0))
                .path("tags", FieldType::array(FieldType::String))
                .with_path("password", SchemaPath::new(FieldType::String).hidden())
                .with_path(
                    "status",
                    SchemaPath::new(FieldType::String).default_value("active"),
                )
                .path("kind", FieldType::String)
                .path("loc", FieldType::Mixed)
        });

        &SCHEMA
    }
}

/// Stored in the same collection as [`Person`], scoped by `kind`.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Admin {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub name: String,
    pub kind: String,
}

impl Model for Admin {
    const COLLECTION_NAME: &'static str = "people";

    fn schema() -> &'static Schema {
        static SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
            Schema::new("Admin")
                .path("_id", FieldType::ObjectId)
                .with_path("name", SchemaPath::new(FieldType::String).required())
                .discriminator("kind", "Admin")
        });

        &SCHEMA
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct Post {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub title: String,
    pub author: Bson,
}

impl Model for Post {
    const COLLECTION_NAME: &'static str = "posts";

    fn schema() -> &'static Schema {
        static SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
            Schema::new("Post")
                .path("_id", FieldType::ObjectId)
                .path("title", FieldType::String)
                .with_path(
                    "author",
                    SchemaPath::new(FieldType::ObjectId).reference("people"),
                )
        });

        &SCHEMA
    }
}

/// Refuses to hydrate records whose name starts with `bad`.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Picky {
    pub name: String,
}

impl Model for Picky {
    const COLLECTION_NAME: &'static str = "picky";

    fn schema() -> &'static Schema {
        static SCHEMA: LazyLock<Schema> =
            LazyLock::new(|| Schema::new("Picky").path("name", FieldType::String));

        &SCHEMA
    }

    fn hydrate(raw: Document, _context: HydrationContext) -> BoxFuture<'static, Result<Self>> {
        async move {
            let name = raw.get_str("name").unwrap_or_default().to_owned();

            if name.starts_with("bad") {
                return Err(Error::Hydration {
                    index: 0,
                    message: name,
                });
            }

            Ok(Self { name })
        }
        .boxed()
    }
}

/// Case-insensitive by default. `code` may only be written as part of a
/// whole document.
#[derive(Debug, Deserialize, PartialEq)]
pub struct Ticket {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub title: String,
    pub code: Option<String>,
}

impl Model for Ticket {
    const COLLECTION_NAME: &'static str = "tickets";

    fn schema() -> &'static Schema {
        static SCHEMA: LazyLock<Schema> = LazyLock::new(|| {
            Schema::new("Ticket")
                .path("_id", FieldType::ObjectId)
                .path("title", FieldType::String)
                .with_path(
                    "code",
                    SchemaPath::new(FieldType::String).validate(Validator::custom(
                        "documentOnly",
                        "Path `code` cannot be set through an update.",
                        |_, context| context == ValidationContext::Document,
                    )),
                )
                .with_collation(doc! { "locale": "en", "strength": 2 })
        });

        &SCHEMA
    }
}

pub fn connect() -> (Arc<MemoryDriver>, Connection) {
    connect_with(Config::default())
}

pub fn connect_with(config: Config) -> (Arc<MemoryDriver>, Connection) {
    let driver = Arc::new(MemoryDriver::new());
    let connection = Connection::new(driver.clone()).with_config(config);
    (driver, connection)
}

/// Inserts kit (31), ann (25) and bob (40, admin) into `people`.
pub fn seed_people(driver: &MemoryDriver) -> Vec<Bson> {
    driver.insert_many(
        "people",
        [
            doc! { "name": "kit", "age": 31, "tags": ["a", "b"], "password": "hunter2" },
            doc! { "name": "ann", "age": 25, "tags": ["b"], "password": "swordfish" },
            doc! { "name": "bob", "age": 40, "kind": "Admin", "password": "letmein" },
        ],
    )
}
