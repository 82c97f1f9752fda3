use crate::{Connection, Error, Query, Result, hydrate::HydrationContext, schema::Schema};
use futures_util::{FutureExt, future::BoxFuture};
use mongodb::bson::{self, Document};
use serde::de::DeserializeOwned;

/// A document type stored in one collection and described by a [`Schema`].
///
/// Usually implemented with `#[derive(Model)]`. The associated functions
/// only declare a query; nothing is sent until [`Query::exec`] is awaited.
pub trait Model: DeserializeOwned + Send + Sync + 'static {
    const COLLECTION_NAME: &'static str;

    fn schema() -> &'static Schema;

    /// Turns a raw record into an instance.
    ///
    /// Failures should be reported as [`Error::Hydration`]; the record index
    /// is filled in by the caller.
    fn hydrate(raw: Document, context: HydrationContext) -> BoxFuture<'static, Result<Self>> {
        let _ = context;

        async move {
            bson::from_document(raw).map_err(|error| Error::Hydration {
                index: 0,
                message: error.to_string(),
            })
        }
        .boxed()
    }

    fn query(connection: &Connection) -> Query<Self> {
        Query::new(connection, Document::new())
    }

    fn find(connection: &Connection, filter: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.find();
        query
    }

    fn find_one(connection: &Connection, filter: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.find_one();
        query
    }

    fn count(connection: &Connection, filter: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.count();
        query
    }

    fn distinct(connection: &Connection, field: &str, filter: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.distinct(field);
        query
    }

    fn delete_one(connection: &Connection, filter: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.delete_one();
        query
    }

    fn delete_many(connection: &Connection, filter: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.delete_many();
        query
    }

    fn update_one(connection: &Connection, filter: Document, update: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.update_one(update);
        query
    }

    fn update_many(connection: &Connection, filter: Document, update: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.update_many(update);
        query
    }

    fn replace_one(
        connection: &Connection,
        filter: Document,
        replacement: Document,
    ) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.replace_one(replacement);
        query
    }

    fn find_one_and_update(
        connection: &Connection,
        filter: Document,
        update: Document,
    ) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.find_one_and_update(update);
        query
    }

    fn find_one_and_remove(connection: &Connection, filter: Document) -> Query<Self> {
        let mut query = Query::new(connection, filter);
        query.find_one_and_remove();
        query
    }
}
