//! Quarry is a fluent query and update builder for `MongoDB`-style document stores.
//!
//! ## Example
//!
//! ```rust,ignore
//! // Describe a model
//! #[derive(Deserialize, Model)]
//! #[model(collection = "users")]
//! struct User {
//!   #[serde(rename = "_id")]
//!   id: ObjectId,
//!   name: String,
//!   #[model(min = 0)]
//!   age: i32,
//!   #[model(hidden)]
//!   password: String,
//! }
//!
//! let connection = Connection::mongo(database);
//!
//! // Declare a query, then run it
//! let mut query = User::find(&connection, doc! { "name": "kit" });
//! query.path("age").gte(18).lt(65);
//! query.sort("-age")?.limit(10);
//!
//! let users = query.exec().await?;
//!
//! // Values are cast to the declared types before dispatch
//! let mut query = User::update_one(&connection, doc! { "name": "kit" }, doc! { "age": "31" });
//! query.set_options(doc! { "runValidators": true })?;
//!
//! let outcome = query.exec().await?;
//!
//! // Skip hydration and read raw documents
//! let mut query = User::find_one(&connection, doc! {});
//! query.lean(true).select("+password")?;
//!
//! let raw = query.exec().await?;
//! ```
//!
//! See [`guides`] module to learn more!

#![warn(clippy::pedantic)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_errors_doc
)]

extern crate self as quarry;

use mongodb::Database;
use std::sync::Arc;

pub use mongodb::bson;
pub use quarry_macros::Model;

pub mod config;
pub mod driver;
pub mod error;
pub mod guides;
pub mod hydrate;
pub mod model;
pub mod normalize;
pub mod options;
pub mod path;
pub mod populate;
pub mod query;
pub mod schema;

mod cast;
mod exec;

pub use config::Config;
pub use driver::{
    DeleteOutcome, Driver, DriverOptions, LastErrorObject, MemoryDriver, MongoDriver,
    RawModifyResult, UpdateOutcome,
};
pub use error::{CastError, DriverError, Error, Result, ValidationError, ValidatorError};
pub use hydrate::{HydrationContext, Outcome, Record};
pub use model::Model;
pub use normalize::{Cmp, Point, Selection, Shape, Slice};
pub use options::{BuilderOptions, QueryOptions, ReadMode, ReadPreference, SortOrder, SortSpec};
pub use populate::{Populate, PopulateOptions, RefPopulator};
pub use query::{Operation, PathScope, Query, QueryTemplate};
pub use schema::{Discriminator, FieldType, Schema, SchemaPath, ValidationContext, Validator};

/// Everything a query needs to reach the database: a driver, a population
/// resolver, and connection-wide defaults.
///
/// Cheap to clone; clones share the same driver.
#[derive(Clone)]
pub struct Connection {
    driver: Arc<dyn Driver>,
    populator: Arc<dyn Populate>,
    config: Arc<Config>,
}

impl Connection {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            populator: Arc::new(RefPopulator::new(driver.clone())),
            driver,
            config: Arc::new(Config::default()),
        }
    }

    /// A connection backed by the official driver.
    pub fn mongo(db: Database) -> Self {
        Self::new(Arc::new(MongoDriver::new(db)))
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_populator(mut self, populator: Arc<dyn Populate>) -> Self {
        self.populator = populator;
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn populator(&self) -> &Arc<dyn Populate> {
        &self.populator
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// An empty builder over `T`'s collection.
    pub fn query<T: Model>(&self) -> Query<T> {
        Query::new(self, bson::Document::new())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl From<Database> for Connection {
    fn from(db: Database) -> Self {
        Self::mongo(db)
    }
}
