//! Cross-document reference population.
//!
//! A directive names a path whose values are `_id`s of documents in another
//! collection. Population replaces those ids with the referenced documents
//! before the records are hydrated.

use crate::{Error, Result, driver::Driver, driver::DriverOptions, path, schema::Schema};
use futures_util::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use mongodb::bson::{Bson, Document, doc};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PopulateOptions {
    pub path: String,
    /// Referenced collection. Falls back to the schema's `reference` for the path.
    pub collection: Option<String>,
    pub select: Option<Document>,
    pub match_filter: Option<Document>,
}

impl PopulateOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn select(mut self, select: Document) -> Self {
        self.select = Some(select);
        self
    }

    pub fn matching(mut self, filter: Document) -> Self {
        self.match_filter = Some(filter);
        self
    }

    /// Parses the `populate` option: a space separated path list, a
    /// directive document, or an array of either.
    pub(crate) fn from_bson(value: &Bson) -> Result<Vec<Self>> {
        const CONTEXT: &str = "Query::populate";

        match value {
            Bson::String(paths) => Ok(paths.split_whitespace().map(Self::new).collect()),
            Bson::Array(items) => {
                let mut directives = Vec::new();
                for item in items {
                    directives.extend(Self::from_bson(item)?);
                }
                Ok(directives)
            }
            Bson::Document(directive) => {
                let Ok(path) = directive.get_str("path") else {
                    return Err(Error::shape(
                        "populate",
                        CONTEXT,
                        "directive must have a string `path`",
                    ));
                };

                let collection = match directive.get("model").or_else(|| directive.get("collection")) {
                    Some(Bson::String(collection)) => Some(collection.clone()),
                    None => None,
                    Some(other) => {
                        return Err(Error::shape(
                            "populate",
                            CONTEXT,
                            format!("collection must be a string, got {other}"),
                        ));
                    }
                };

                let select = match directive.get("select") {
                    None => None,
                    Some(Bson::String(list)) => Some(
                        list.split_whitespace()
                            .map(|token| match token.strip_prefix('-') {
                                Some(path) => (path.to_owned(), Bson::Int32(0)),
                                None => (token.to_owned(), Bson::Int32(1)),
                            })
                            .collect(),
                    ),
                    Some(Bson::Document(select)) => Some(select.clone()),
                    Some(other) => {
                        return Err(Error::shape(
                            "populate",
                            CONTEXT,
                            format!("select must be a string or a document, got {other}"),
                        ));
                    }
                };

                let match_filter = match directive.get("match") {
                    None => None,
                    Some(Bson::Document(filter)) => Some(filter.clone()),
                    Some(other) => {
                        return Err(Error::shape(
                            "populate",
                            CONTEXT,
                            format!("match must be a document, got {other}"),
                        ));
                    }
                };

                Ok(vec![Self {
                    path: path.to_owned(),
                    collection,
                    select,
                    match_filter,
                }])
            }
            other => Err(Error::shape(
                "populate",
                CONTEXT,
                format!("must be a string, a document or an array, got {other}"),
            )),
        }
    }
}

impl From<&str> for PopulateOptions {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Replaces reference ids in raw records with the documents they point to.
pub trait Populate: Send + Sync {
    fn populate<'a>(
        &'a self,
        schema: &'a Schema,
        records: Vec<Document>,
        directives: &'a [PopulateOptions],
    ) -> BoxFuture<'a, Result<Vec<Document>>>;
}

/// [`Populate`] that looks referenced documents up by `_id` through a [`Driver`].
///
/// Every directive is resolved with a single `$in` query; the queries for
/// different directives run concurrently.
#[derive(Clone)]
pub struct RefPopulator {
    driver: Arc<dyn Driver>,
}

impl RefPopulator {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    fn fetch<'a>(
        &'a self,
        collection: &'a str,
        directive: &'a PopulateOptions,
        ids: Vec<Bson>,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut filter = directive.match_filter.clone().unwrap_or_default();
            filter.insert("_id", doc! { "$in": ids });

            let options = DriverOptions {
                projection: directive.select.clone(),
                ..DriverOptions::default()
            };

            self.driver.find(collection, filter, options).await
        }
        .boxed()
    }
}

fn resolve_collection(schema: &Schema, directive: &PopulateOptions) -> Result<String> {
    directive
        .collection
        .clone()
        .or_else(|| schema.reference_for(&directive.path).map(ToOwned::to_owned))
        .ok_or_else(|| {
            Error::shape(
                "populate",
                "RefPopulator",
                format!(
                    "path `{}` has no reference collection on model `{}`",
                    directive.path,
                    schema.name()
                ),
            )
        })
}

fn referenced_ids(records: &[Document], reference: &str) -> Vec<Bson> {
    let mut ids: Vec<Bson> = Vec::new();

    for record in records {
        let found = match path::get(record, reference) {
            Some(Bson::Array(items)) => items.iter().collect(),
            Some(Bson::Null) | None => Vec::new(),
            Some(id) => vec![id],
        };

        for id in found {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
    }

    ids
}

fn lookup<'a>(found: &'a [Document], id: &Bson) -> Option<&'a Document> {
    found.iter().find(|document| document.get("_id") == Some(id))
}

fn splice(records: &mut [Document], reference: &str, found: &[Document]) {
    for record in records {
        let replaced = match path::get(record, reference) {
            Some(Bson::Array(items)) => Bson::Array(
                items
                    .iter()
                    .filter_map(|id| lookup(found, id).cloned().map(Bson::Document))
                    .collect(),
            ),
            Some(Bson::Null) | None => continue,
            Some(id) => lookup(found, id).cloned().map_or(Bson::Null, Bson::Document),
        };

        path::set(record, reference, replaced);
    }
}

impl Populate for RefPopulator {
    fn populate<'a>(
        &'a self,
        schema: &'a Schema,
        mut records: Vec<Document>,
        directives: &'a [PopulateOptions],
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        async move {
            let collections = directives
                .iter()
                .map(|directive| resolve_collection(schema, directive))
                .collect::<Result<Vec<_>>>()?;

            let fetches = directives
                .iter()
                .zip(&collections)
                .map(|(directive, collection)| {
                    let ids = referenced_ids(&records, &directive.path);
                    self.fetch(collection, directive, ids)
                });

            let fetched = join_all(fetches)
                .await
                .into_iter()
                .collect::<Result<Vec<_>>>()?;

            for (directive, found) in directives.iter().zip(&fetched) {
                splice(&mut records, &directive.path, found);
            }

            Ok(records)
        }
        .boxed()
    }
}
