use crate::{
    Error, Result,
    driver::{DeleteOutcome, RawModifyResult, UpdateOutcome},
    model::Model,
};
use futures_util::future::join_all;
use mongodb::bson::{Bson, Document};

/// What a hydrated record was fetched with.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HydrationContext {
    /// Projection actually sent to the driver.
    pub projection: Option<Document>,
    /// Projection as the caller selected it.
    pub user_projection: Option<Document>,
    /// Paths replaced by population.
    pub populated: Vec<String>,
}

/// One result record, hydrated or raw.
#[derive(Clone, Debug, PartialEq)]
pub enum Record<T> {
    Instance(T),
    Lean(Document),
}

impl<T> Record<T> {
    pub fn instance(self) -> Option<T> {
        match self {
            Self::Instance(instance) => Some(instance),
            Self::Lean(_) => None,
        }
    }

    pub fn lean(self) -> Option<Document> {
        match self {
            Self::Lean(document) => Some(document),
            Self::Instance(_) => None,
        }
    }

    pub fn as_instance(&self) -> Option<&T> {
        match self {
            Self::Instance(instance) => Some(instance),
            Self::Lean(_) => None,
        }
    }

    pub fn as_lean(&self) -> Option<&Document> {
        match self {
            Self::Lean(document) => Some(document),
            Self::Instance(_) => None,
        }
    }
}

/// The value delivered by [`Query::exec`](crate::Query::exec), one variant per result shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<T> {
    Many(Vec<Record<T>>),
    One(Option<Record<T>>),
    Count(u64),
    Distinct(Vec<Bson>),
    Deleted(DeleteOutcome),
    Updated(UpdateOutcome),
    Raw(RawModifyResult),
}

impl<T> Outcome<T> {
    pub fn many(self) -> Option<Vec<Record<T>>> {
        match self {
            Self::Many(records) => Some(records),
            _ => None,
        }
    }

    pub fn one(self) -> Option<Option<Record<T>>> {
        match self {
            Self::One(record) => Some(record),
            _ => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            Self::Count(count) => Some(*count),
            _ => None,
        }
    }

    pub fn distinct(self) -> Option<Vec<Bson>> {
        match self {
            Self::Distinct(values) => Some(values),
            _ => None,
        }
    }

    pub fn deleted(&self) -> Option<&DeleteOutcome> {
        match self {
            Self::Deleted(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn updated(&self) -> Option<&UpdateOutcome> {
        match self {
            Self::Updated(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn raw(self) -> Option<RawModifyResult> {
        match self {
            Self::Raw(raw) => Some(raw),
            _ => None,
        }
    }
}

/// Hydrates every record concurrently, keeping order.
///
/// All hydrations run to completion; the error of the lowest failing index is returned.
pub(crate) async fn hydrate_all<T: Model>(
    records: Vec<Document>,
    context: &HydrationContext,
) -> Result<Vec<T>> {
    let hydrations = records
        .into_iter()
        .map(|raw| T::hydrate(raw, context.clone()));

    join_all(hydrations)
        .await
        .into_iter()
        .enumerate()
        .map(|(index, result)| {
            result.map_err(|error| match error {
                Error::Hydration { message, .. } => Error::Hydration { index, message },
                other => other,
            })
        })
        .collect()
}

/// Wraps raw records, hydrating them unless `lean` is set.
pub(crate) async fn deliver<T: Model>(
    records: Vec<Document>,
    lean: bool,
    context: &HydrationContext,
) -> Result<Vec<Record<T>>> {
    if lean {
        return Ok(records.into_iter().map(Record::Lean).collect());
    }

    Ok(hydrate_all::<T>(records, context)
        .await?
        .into_iter()
        .map(Record::Instance)
        .collect())
}
