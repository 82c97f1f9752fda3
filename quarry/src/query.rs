//! The query builder.
//!
//! A [`Query`] accumulates conditions, a projection, an update document and
//! options through `&mut self` calls, in any order. Nothing touches the
//! database until [`Query::exec`] is awaited.
//!
//! ```rust,ignore
//! let mut query = User::find(&connection, doc! { "name": "kit" });
//!
//! query
//!     .select("name age -_id")?
//!     .sort("-age")?
//!     .limit(10)
//!     .path("age")
//!     .gte(18)
//!     .lt(65);
//!
//! let users = query.exec().await?;
//! ```

use crate::{
    Connection, Error, Result,
    cast,
    model::Model,
    normalize::{self, Cmp, Point, Selection, Shape, Slice},
    options::{self, BuilderOptions, QueryOptions, ReadPreference, SortSpec},
    populate::PopulateOptions,
};
use mongodb::bson::{self, Bson, Document};
use serde::Serialize;
use std::{collections::HashMap, fmt, marker::PhantomData, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Find,
    FindOne,
    Count,
    Distinct,
    /// Deletes every match unless the `single` option is set.
    Remove,
    DeleteOne,
    DeleteMany,
    /// Updates one match unless `multi` is set; replaces it when `overwrite` is set.
    Update,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    FindOneAndUpdate,
    FindOneAndRemove,
}

impl Operation {
    pub fn name(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::FindOne => "findOne",
            Self::Count => "count",
            Self::Distinct => "distinct",
            Self::Remove => "remove",
            Self::DeleteOne => "deleteOne",
            Self::DeleteMany => "deleteMany",
            Self::Update => "update",
            Self::UpdateOne => "updateOne",
            Self::UpdateMany => "updateMany",
            Self::ReplaceOne => "replaceOne",
            Self::FindOneAndUpdate => "findOneAndUpdate",
            Self::FindOneAndRemove => "findOneAndRemove",
        }
    }
}

pub struct Query<T: Model> {
    pub(crate) connection: Connection,
    pub(crate) op: Option<Operation>,
    pub(crate) conditions: Document,
    pub(crate) fields: Option<Document>,
    /// Hidden paths selected with `+path`.
    pub(crate) forced_includes: Vec<String>,
    pub(crate) update: Document,
    pub(crate) options: QueryOptions,
    pub(crate) builder_options: BuilderOptions,
    pub(crate) distinct_field: Option<String>,
    pub(crate) last_path: Option<String>,
    pub(crate) status: std::result::Result<(), Error>,
    pub(crate) legacy_geo: bool,
    model: PhantomData<fn() -> T>,
}

impl<T: Model> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            connection: self.connection.clone(),
            op: self.op,
            conditions: self.conditions.clone(),
            fields: self.fields.clone(),
            forced_includes: self.forced_includes.clone(),
            update: self.update.clone(),
            options: self.options.clone(),
            builder_options: self.builder_options.clone(),
            distinct_field: self.distinct_field.clone(),
            last_path: self.last_path.clone(),
            status: self.status.clone(),
            legacy_geo: self.legacy_geo,
            model: PhantomData,
        }
    }
}

impl<T: Model> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("model", &T::schema().name())
            .field("op", &self.op)
            .field("conditions", &self.conditions)
            .field("fields", &self.fields)
            .field("update", &self.update)
            .field("options", &self.options)
            .field("builder_options", &self.builder_options)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl<T: Model> Query<T> {
    /// A builder over `T`'s collection starting from `conditions`.
    pub fn new(connection: &Connection, conditions: Document) -> Self {
        let schema = T::schema();

        let mut query = Self {
            connection: connection.clone(),
            op: None,
            conditions,
            fields: None,
            forced_includes: Vec::new(),
            update: Document::new(),
            options: QueryOptions::default(),
            builder_options: BuilderOptions::default(),
            distinct_field: None,
            last_path: None,
            status: Ok(()),
            legacy_geo: connection.config().legacy_geo,
            model: PhantomData,
        };

        query.options.collation = schema.collation().cloned();
        query.scope_to_discriminator();
        query
    }

    pub(crate) fn scope_to_discriminator(&mut self) {
        if let Some(discriminator) = T::schema().discriminator_mapping() {
            normalize::inject_discriminator(&mut self.conditions, discriminator);
        }
    }

    /// Merges recognized options; builder-only keys never reach the driver.
    pub fn set_options(&mut self, options: Document) -> Result<&mut Self> {
        let parsed = options::parse(&options)?;

        if let Some(projection) = parsed.projection {
            self.select(projection)?;
        }
        self.options.merge(&parsed.options);
        self.builder_options.merge(&parsed.builder);

        Ok(self)
    }

    /// Replaces both option stores wholesale.
    pub(crate) fn set_options_overwrite(&mut self, options: QueryOptions, builder: BuilderOptions) {
        self.options = options;
        self.builder_options = builder;
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn builder_options(&self) -> &BuilderOptions {
        &self.builder_options
    }

    /// The pending error, if any. A pending error fails every dispatch.
    pub fn error(&self) -> Option<&Error> {
        self.status.as_ref().err()
    }

    /// Records `error`, or clears the pending error with `None`.
    pub fn set_error(&mut self, error: Option<Error>) -> &mut Self {
        self.status = match error {
            Some(error) => Err(error),
            None => Ok(()),
        };
        self
    }

    pub fn read(&mut self, mode: &str, tag_sets: Vec<HashMap<String, String>>) -> Result<&mut Self> {
        self.options.read_preference = Some(ReadPreference::parse(mode, tag_sets)?);
        Ok(self)
    }

    pub fn read_preference(&mut self, preference: ReadPreference) -> &mut Self {
        self.options.read_preference = Some(preference);
        self
    }

    /// Skip hydration and deliver raw records.
    pub fn lean(&mut self, lean: bool) -> &mut Self {
        self.builder_options.lean = Some(lean);
        self
    }

    pub fn populate(&mut self, directive: impl Into<PopulateOptions>) -> &mut Self {
        self.builder_options.add_populate(directive.into());
        self
    }

    /// Turn an empty single-document result into [`Error::DocumentNotFound`].
    pub fn or_fail(&mut self) -> &mut Self {
        self.builder_options.or_fail = Some(true);
        self
    }

    pub fn omit_undefined(&mut self, omit: bool) -> &mut Self {
        self.builder_options.omit_undefined = Some(omit);
        self
    }

    pub fn limit(&mut self, limit: i64) -> &mut Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn skip(&mut self, skip: u64) -> &mut Self {
        self.options.skip = Some(skip);
        self
    }

    pub fn collation(&mut self, collation: Document) -> &mut Self {
        self.options.collation = Some(collation);
        self
    }

    pub fn max_time(&mut self, max_time: Duration) -> &mut Self {
        self.options.max_time = Some(max_time);
        self
    }

    pub fn comment(&mut self, comment: impl Into<Bson>) -> &mut Self {
        self.options.comment = Some(comment.into());
        self
    }

    pub fn batch_size(&mut self, batch_size: u32) -> &mut Self {
        self.options.batch_size = Some(batch_size);
        self
    }

    pub fn upsert(&mut self, upsert: bool) -> &mut Self {
        self.options.upsert = Some(upsert);
        self
    }

    /// Appends sort keys. A key sorted again keeps its position and takes the new order.
    pub fn sort(&mut self, sort: impl Into<SortSpec>) -> Result<&mut Self> {
        let pairs = sort.into().into_pairs()?;
        let sort = self.options.sort.get_or_insert_with(Vec::new);

        for (path, order) in pairs {
            match sort.iter_mut().find(|(existing, _)| *existing == path) {
                Some(existing) => existing.1 = order,
                None => sort.push((path, order)),
            }
        }

        Ok(self)
    }

    pub fn select(&mut self, selection: impl Into<Selection>) -> Result<&mut Self> {
        normalize::select(&mut self.fields, &mut self.forced_includes, selection.into())?;
        Ok(self)
    }

    pub fn slice(&mut self, path: &str, slice: Slice) -> &mut Self {
        self.fields
            .get_or_insert_with(Document::new)
            .insert(path, slice.directive());
        self
    }

    /// Applies `{ path: n | [skip, limit] }` per key.
    pub fn slice_many(&mut self, slices: Document) -> Result<&mut Self> {
        let parsed = slices
            .iter()
            .map(|(path, value)| Ok((path.clone(), Slice::from_bson(value)?)))
            .collect::<Result<Vec<_>>>()?;

        for (path, slice) in parsed {
            self.slice(&path, slice);
        }

        Ok(self)
    }

    /// Slices the path named by the last [`Query::path`] call.
    pub fn slice_last(&mut self, slice: Slice) -> Result<&mut Self> {
        let path = self.require_last_path("slice")?;
        Ok(self.slice(&path, slice))
    }

    /// Scopes the following comparisons to `path`.
    pub fn path(&mut self, path: &str) -> PathScope<'_, T> {
        self.last_path = Some(path.to_owned());

        PathScope {
            path: path.to_owned(),
            query: self,
        }
    }

    fn require_last_path(&self, method: &'static str) -> Result<String> {
        self.last_path
            .clone()
            .ok_or(Error::PathRequired { method })
    }

    /// Equality on the last scoped path.
    pub fn equals(&mut self, value: impl Into<Bson>) -> Result<&mut Self> {
        let path = self.require_last_path("equals")?;
        self.conditions.insert(path, value.into());
        Ok(self)
    }

    /// Applies `operator` to the last scoped path.
    pub fn last(&mut self, operator: Cmp, value: impl Into<Bson>) -> Result<&mut Self> {
        let path = self.require_last_path(operator.sigil())?;
        normalize::apply_operator(&mut self.conditions, &path, operator.sigil(), value.into());
        Ok(self)
    }

    /// Applies `operator` to `path`.
    pub fn condition(&mut self, path: &str, operator: Cmp, value: impl Into<Bson>) -> &mut Self {
        self.last_path = Some(path.to_owned());
        normalize::apply_operator(&mut self.conditions, path, operator.sigil(), value.into());
        self
    }

    fn push_clauses(&mut self, operator: &str, clauses: impl IntoIterator<Item = Document>) -> &mut Self {
        let clauses = clauses.into_iter().map(Bson::Document);

        match self.conditions.get_mut(operator) {
            Some(Bson::Array(existing)) => existing.extend(clauses),
            _ => {
                self.conditions
                    .insert(operator, clauses.collect::<Vec<_>>());
            }
        }

        self
    }

    pub fn or(&mut self, clauses: impl IntoIterator<Item = Document>) -> &mut Self {
        self.push_clauses("$or", clauses)
    }

    pub fn and(&mut self, clauses: impl IntoIterator<Item = Document>) -> &mut Self {
        self.push_clauses("$and", clauses)
    }

    pub fn nor(&mut self, clauses: impl IntoIterator<Item = Document>) -> &mut Self {
        self.push_clauses("$nor", clauses)
    }

    /// Merges another builder's state; `source` wins on conflicts.
    pub fn merge_query(&mut self, source: &Query<T>) -> Result<&mut Self> {
        if let Some(fields) = &source.fields {
            let mut merged = self.fields.clone().unwrap_or_default();
            normalize::deep_merge(&mut merged, fields);
            normalize::check_polarity(&merged)?;
            self.fields = Some(merged);
        }
        for key in &source.forced_includes {
            if !self.forced_includes.contains(key) {
                self.forced_includes.push(key.clone());
            }
        }

        normalize::deep_merge(&mut self.conditions, &source.conditions);
        normalize::deep_merge(&mut self.update, &source.update);
        self.options.merge(&source.options);
        self.builder_options.merge(&source.builder_options);

        if source.distinct_field.is_some() {
            self.distinct_field.clone_from(&source.distinct_field);
        }

        self.scope_to_discriminator();
        Ok(self)
    }

    /// Merges `conditions` into the filter only.
    pub fn merge_conditions(&mut self, conditions: &Document) -> &mut Self {
        normalize::deep_merge(&mut self.conditions, conditions);
        self.scope_to_discriminator();
        self
    }

    /// Merges a filter given as an arbitrary value. Only documents are accepted.
    pub fn merge_value(&mut self, source: Bson) -> Result<&mut Self> {
        match source {
            Bson::Document(conditions) => Ok(self.merge_conditions(&conditions)),
            other => Err(Error::shape(
                "source",
                "Query::merge",
                format!("must be a document or a query, got {}", type_name(&other)),
            )),
        }
    }

    /// Serializes `source` and merges it as a filter.
    pub fn filter_from<S: Serialize + ?Sized>(&mut self, source: &S) -> Result<&mut Self> {
        let value = bson::to_bson(source)
            .map_err(|error| Error::shape("source", "Query::merge", error.to_string()))?;
        self.merge_value(value)
    }

    fn merge_update(&mut self, update: Document) {
        if self.options.overwrite == Some(true) {
            self.update = update;
        } else {
            normalize::deep_merge(&mut self.update, &update);
        }
    }

    pub fn set(&mut self, path: &str, value: impl Into<Bson>) -> &mut Self {
        self.update_operator("$set", path, value.into())
    }

    pub fn unset(&mut self, path: &str) -> &mut Self {
        self.update_operator("$unset", path, Bson::String(String::new()))
    }

    pub fn inc(&mut self, path: &str, by: impl Into<Bson>) -> &mut Self {
        self.update_operator("$inc", path, by.into())
    }

    pub fn push(&mut self, path: &str, value: impl Into<Bson>) -> &mut Self {
        self.update_operator("$push", path, value.into())
    }

    fn update_operator(&mut self, operator: &str, path: &str, value: Bson) -> &mut Self {
        match self.update.get_mut(operator) {
            Some(Bson::Document(bucket)) => {
                bucket.insert(path, value);
            }
            _ => {
                let mut bucket = Document::new();
                bucket.insert(path, value);
                self.update.insert(operator, bucket);
            }
        }
        self
    }

    /// The accumulated filter, exactly as built.
    pub fn conditions(&self) -> &Document {
        &self.conditions
    }

    /// The accumulated update document, exactly as built.
    pub fn update_document(&self) -> &Document {
        &self.update
    }

    pub fn projection(&self) -> Option<&Document> {
        self.fields.as_ref()
    }

    pub fn operation(&self) -> Option<Operation> {
        self.op
    }

    pub fn distinct_field(&self) -> Option<&str> {
        self.distinct_field.as_deref()
    }

    pub fn find(&mut self) -> &mut Self {
        self.op = Some(Operation::Find);
        self
    }

    pub fn find_one(&mut self) -> &mut Self {
        self.op = Some(Operation::FindOne);
        self
    }

    pub fn count(&mut self) -> &mut Self {
        self.op = Some(Operation::Count);
        self
    }

    pub fn distinct(&mut self, field: &str) -> &mut Self {
        self.op = Some(Operation::Distinct);
        self.distinct_field = Some(field.to_owned());
        self
    }

    pub fn remove(&mut self) -> &mut Self {
        self.op = Some(Operation::Remove);
        self
    }

    pub fn delete_one(&mut self) -> &mut Self {
        self.op = Some(Operation::DeleteOne);
        self
    }

    pub fn delete_many(&mut self) -> &mut Self {
        self.op = Some(Operation::DeleteMany);
        self
    }

    pub fn update(&mut self, update: Document) -> &mut Self {
        self.op = Some(Operation::Update);
        self.merge_update(update);
        self
    }

    pub fn update_one(&mut self, update: Document) -> &mut Self {
        self.op = Some(Operation::UpdateOne);
        self.merge_update(update);
        self
    }

    pub fn update_many(&mut self, update: Document) -> &mut Self {
        self.op = Some(Operation::UpdateMany);
        self.merge_update(update);
        self
    }

    pub fn replace_one(&mut self, replacement: Document) -> &mut Self {
        self.op = Some(Operation::ReplaceOne);
        self.update = replacement;
        self
    }

    pub fn find_one_and_update(&mut self, update: Document) -> &mut Self {
        self.op = Some(Operation::FindOneAndUpdate);
        self.merge_update(update);
        self
    }

    pub fn find_one_and_remove(&mut self) -> &mut Self {
        self.op = Some(Operation::FindOneAndRemove);
        self
    }

    pub(crate) fn strict_query(&self) -> bool {
        self.options
            .strict_query
            .or(T::schema().strict_query())
            .unwrap_or(self.connection.config().strict_query)
    }

    pub(crate) fn strict(&self) -> bool {
        self.builder_options
            .strict
            .or(self.options.strict)
            .unwrap_or(T::schema().strict())
    }

    /// The filter as it would be dispatched, or the cast error.
    pub fn cast(&self) -> Result<Document> {
        let mut conditions = self.conditions.clone();
        if let Some(discriminator) = T::schema().discriminator_mapping() {
            normalize::inject_discriminator(&mut conditions, discriminator);
        }

        cast::cast_filter(T::schema(), &conditions, self.strict_query())
    }

    /// Captures the current state as a reusable factory.
    pub fn to_template(&self) -> QueryTemplate<T> {
        QueryTemplate {
            query: self.clone(),
        }
    }
}

fn type_name(value: &Bson) -> &'static str {
    match value {
        Bson::String(_) => "a string",
        Bson::Array(_) => "an array",
        Bson::Boolean(_) => "a boolean",
        Bson::Null | Bson::Undefined => "null",
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => "a number",
        Bson::ObjectId(_) => "an ObjectId",
        Bson::DateTime(_) => "a date",
        _ => "an unsupported value",
    }
}

/// Comparisons bound to one path.
pub struct PathScope<'a, T: Model> {
    query: &'a mut Query<T>,
    path: String,
}

impl<'a, T: Model> PathScope<'a, T> {
    fn operator(self, operator: Cmp, value: impl Into<Bson>) -> Self {
        normalize::apply_operator(
            &mut self.query.conditions,
            &self.path,
            operator.sigil(),
            value.into(),
        );
        self
    }

    pub fn equals(self, value: impl Into<Bson>) -> Self {
        self.query.conditions.insert(self.path.clone(), value.into());
        self
    }

    pub fn eq(self, value: impl Into<Bson>) -> Self {
        self.operator(Cmp::Eq, value)
    }

    pub fn ne(self, value: impl Into<Bson>) -> Self {
        self.operator(Cmp::Ne, value)
    }

    pub fn gt(self, value: impl Into<Bson>) -> Self {
        self.operator(Cmp::Gt, value)
    }

    pub fn gte(self, value: impl Into<Bson>) -> Self {
        self.operator(Cmp::Gte, value)
    }

    pub fn lt(self, value: impl Into<Bson>) -> Self {
        self.operator(Cmp::Lt, value)
    }

    pub fn lte(self, value: impl Into<Bson>) -> Self {
        self.operator(Cmp::Lte, value)
    }

    pub fn is_in(self, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        self.operator(Cmp::In, values)
    }

    pub fn nin(self, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        self.operator(Cmp::Nin, values)
    }

    pub fn all(self, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        let values: Vec<Bson> = values.into_iter().map(Into::into).collect();
        self.operator(Cmp::All, values)
    }

    pub fn size(self, size: i32) -> Self {
        self.operator(Cmp::Size, size)
    }

    pub fn exists(self, exists: bool) -> Self {
        self.operator(Cmp::Exists, exists)
    }

    pub fn regex(self, pattern: &str) -> Self {
        self.operator(Cmp::Regex, pattern)
    }

    pub fn elem_match(self, condition: Document) -> Self {
        self.operator(Cmp::ElemMatch, condition)
    }

    pub fn modulo(self, divisor: i64, remainder: i64) -> Self {
        self.operator(Cmp::Mod, vec![divisor, remainder])
    }

    pub fn near(self, point: Point, max_distance: Option<f64>) -> Self {
        let legacy = self.query.legacy_geo;
        for (operator, value) in normalize::near(point, max_distance, legacy) {
            normalize::apply_operator(&mut self.query.conditions, &self.path, &operator, value);
        }
        self
    }

    pub fn within(self, shape: &Shape) -> Self {
        let legacy = self.query.legacy_geo;
        for (operator, value) in normalize::within(shape, legacy) {
            normalize::apply_operator(&mut self.query.conditions, &self.path, &operator, value);
        }
        self
    }

    pub fn slice(self, slice: Slice) -> Self {
        self.query.slice(&self.path, slice);
        self
    }

    /// Ends the scope, handing back the builder.
    pub fn into_query(self) -> &'a mut Query<T> {
        self.query
    }
}

/// A reusable factory capturing a builder's state at template time.
///
/// Every [`QueryTemplate::query`] call produces an independent builder.
pub struct QueryTemplate<T: Model> {
    query: Query<T>,
}

impl<T: Model> Clone for QueryTemplate<T> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
        }
    }
}

impl<T: Model> QueryTemplate<T> {
    pub fn query(&self) -> Query<T> {
        let source = &self.query;

        let mut query = Query::new(&source.connection, source.conditions.clone());
        query.set_options_overwrite(source.options.clone(), source.builder_options.clone());
        query.op = source.op;
        query.fields.clone_from(&source.fields);
        query.forced_includes.clone_from(&source.forced_includes);
        query.update.clone_from(&source.update);
        query.distinct_field.clone_from(&source.distinct_field);
        query.legacy_geo = source.legacy_geo;
        query
    }
}
