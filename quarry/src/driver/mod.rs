//! The seam between the dispatch engine and the database driver.
//!
//! Every method receives the collection namespace, the cast filter, and
//! translated [`DriverOptions`]. Implementations report failures as
//! [`Error::Driver`](crate::Error::Driver); the engine never reinterprets them.

use crate::{Result, options::ReadPreference};
use futures_util::future::BoxFuture;
use mongodb::bson::{Bson, Document};
use std::time::Duration;

pub mod memory;
pub mod mongo;

pub use memory::MemoryDriver;
pub use mongo::MongoDriver;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DriverOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    pub collation: Option<Document>,
    pub read_preference: Option<ReadPreference>,
    pub upsert: Option<bool>,
    /// Return the post-image from find-and-modify calls.
    pub return_new: Option<bool>,
    pub array_filters: Option<Vec<Document>>,
    pub max_time: Option<Duration>,
    pub comment: Option<Bson>,
    pub batch_size: Option<u32>,
    pub extra: Document,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteOutcome {
    pub acknowledged: bool,
    pub deleted_count: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOutcome {
    pub acknowledged: bool,
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

impl UpdateOutcome {
    pub(crate) fn unacknowledged() -> Self {
        Self {
            acknowledged: false,
            matched_count: 0,
            modified_count: 0,
            upserted_id: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LastErrorObject {
    pub n: u64,
    pub updated_existing: Option<bool>,
    pub upserted: Option<Bson>,
}

/// The full envelope of a find-and-modify command.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawModifyResult {
    pub value: Option<Document>,
    pub last_error_object: LastErrorObject,
    pub ok: f64,
}

impl RawModifyResult {
    pub(crate) fn from_command_reply(mut reply: Document) -> Self {
        let value = match reply.remove("value") {
            Some(Bson::Document(value)) => Some(value),
            _ => None,
        };

        let last_error_object = match reply.get_document("lastErrorObject") {
            Ok(object) => LastErrorObject {
                n: object
                    .get("n")
                    .and_then(|n| match n {
                        Bson::Int32(n) => u64::try_from(*n).ok(),
                        Bson::Int64(n) => u64::try_from(*n).ok(),
                        _ => None,
                    })
                    .unwrap_or_default(),
                updated_existing: object.get_bool("updatedExisting").ok(),
                upserted: object.get("upserted").cloned(),
            },
            Err(_) => LastErrorObject::default(),
        };

        let ok = match reply.get("ok") {
            Some(Bson::Double(ok)) => *ok,
            Some(Bson::Int32(ok)) => f64::from(*ok),
            _ => 0.0,
        };

        Self {
            value,
            last_error_object,
            ok,
        }
    }
}

pub trait Driver: Send + Sync {
    fn find<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<Vec<Document>>>;

    fn find_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<Option<Document>>>;

    fn count<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<u64>>;

    fn distinct<'a>(
        &'a self,
        namespace: &'a str,
        field: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<Vec<Bson>>>;

    fn delete_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<DeleteOutcome>>;

    fn delete_many<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<DeleteOutcome>>;

    fn update_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>>;

    fn update_many<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>>;

    fn replace_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        replacement: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>>;

    fn find_one_and_update<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<RawModifyResult>>;

    fn find_one_and_delete<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<RawModifyResult>>;
}
