//! An in-process [`Driver`] that keeps collections in memory.
//!
//! Every request is recorded before it is served, so tests can assert on the
//! exact filter, update document and options the dispatch engine produced.
//! The query language covers the comparison, logical, element and array
//! operators plus the common update operators; anything else is reported as
//! a driver error.

use super::{DeleteOutcome, Driver, DriverOptions, LastErrorObject, RawModifyResult, UpdateOutcome};
use crate::{
    Error, Result,
    error::DriverError,
    path,
    schema::as_f64,
};
use dashmap::DashMap;
use futures_util::{FutureExt, future::BoxFuture};
use mongodb::bson::{self, Bson, Document, oid::ObjectId};
use std::{
    cmp::Ordering,
    sync::{Mutex, PoisonError},
};

/// One recorded driver request.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub method: &'static str,
    pub namespace: String,
    pub filter: Document,
    /// Update or replacement document, when the method takes one.
    pub document: Option<Document>,
    /// Field name of a `distinct` call.
    pub field: Option<String>,
    pub options: DriverOptions,
}

#[derive(Debug, Default)]
pub struct MemoryDriver {
    collections: DashMap<String, Vec<Document>>,
    calls: Mutex<Vec<Call>>,
    failure: Mutex<Option<DriverError>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `document`, assigning an `ObjectId` when `_id` is missing. Returns the id.
    pub fn insert(&self, namespace: &str, mut document: Document) -> Bson {
        let id = ensure_id(&mut document);
        self.collections
            .entry(namespace.to_owned())
            .or_default()
            .push(document);
        id
    }

    pub fn insert_many(
        &self,
        namespace: &str,
        documents: impl IntoIterator<Item = Document>,
    ) -> Vec<Bson> {
        documents
            .into_iter()
            .map(|document| self.insert(namespace, document))
            .collect()
    }

    /// Snapshot of a collection in insertion order.
    pub fn documents(&self, namespace: &str) -> Vec<Document> {
        self.collections
            .get(namespace)
            .map(|documents| documents.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Makes the next request fail with `error` after it has been recorded.
    pub fn fail_next(&self, error: DriverError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    fn begin(
        &self,
        method: &'static str,
        namespace: &str,
        filter: &Document,
        document: Option<&Document>,
        field: Option<&str>,
        options: &DriverOptions,
    ) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Call {
                method,
                namespace: namespace.to_owned(),
                filter: filter.clone(),
                document: document.cloned(),
                field: field.map(ToOwned::to_owned),
                options: options.clone(),
            });

        match self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(error) => Err(Error::Driver(error)),
            None => Ok(()),
        }
    }

    /// Matching documents, sorted, with skip and limit applied, unprojected.
    fn select(
        &self,
        namespace: &str,
        filter: &Document,
        options: &DriverOptions,
    ) -> Result<Vec<Document>> {
        let mut selected = Vec::new();

        if let Some(documents) = self.collections.get(namespace) {
            for document in documents.iter() {
                if matches(document, filter)? {
                    selected.push(document.clone());
                }
            }
        }

        if let Some(sort) = &options.sort {
            sort_documents(&mut selected, sort);
        }

        let skip = usize::try_from(options.skip.unwrap_or_default()).unwrap_or(usize::MAX);
        let limit = match options.limit {
            Some(limit) if limit != 0 => usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX),
            _ => usize::MAX,
        };

        Ok(selected.into_iter().skip(skip).take(limit).collect())
    }

    /// Position of the first matching document in storage order after sorting.
    fn position(
        documents: &[Document],
        filter: &Document,
        sort: Option<&Document>,
    ) -> Result<Option<usize>> {
        let mut candidates = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            if matches(document, filter)? {
                candidates.push(index);
            }
        }

        if let Some(sort) = sort {
            candidates.sort_by(|a, b| compare_by_sort(&documents[*a], &documents[*b], sort));
        }

        Ok(candidates.first().copied())
    }

    fn update(
        &self,
        namespace: &str,
        filter: &Document,
        update: &Document,
        options: &DriverOptions,
        multi: bool,
    ) -> Result<UpdateOutcome> {
        let mut documents = self.collections.entry(namespace.to_owned()).or_default();

        let mut matched_count = 0;
        let mut modified_count = 0;

        for document in documents.iter_mut() {
            if !matches(document, filter)? {
                continue;
            }

            matched_count += 1;

            let mut updated = document.clone();
            apply_update(&mut updated, update, false)?;
            if updated != *document {
                *document = updated;
                modified_count += 1;
            }

            if !multi {
                break;
            }
        }

        let mut upserted_id = None;

        if matched_count == 0 && options.upsert == Some(true) {
            let mut document = seed_from_filter(filter);
            apply_update(&mut document, update, true)?;
            upserted_id = Some(ensure_id(&mut document));
            documents.push(document);
        }

        Ok(UpdateOutcome {
            acknowledged: true,
            matched_count,
            modified_count,
            upserted_id,
        })
    }

    fn delete(&self, namespace: &str, filter: &Document, multi: bool) -> Result<DeleteOutcome> {
        let mut deleted_count = 0;

        if let Some(mut documents) = self.collections.get_mut(namespace) {
            let mut doomed = Vec::new();

            for (index, document) in documents.iter().enumerate() {
                if matches(document, filter)? {
                    doomed.push(index);
                    if !multi {
                        break;
                    }
                }
            }

            for index in doomed.iter().rev() {
                documents.remove(*index);
            }

            deleted_count = u64::try_from(doomed.len()).unwrap_or(u64::MAX);
        }

        Ok(DeleteOutcome {
            acknowledged: true,
            deleted_count,
        })
    }
}

impl Driver for MemoryDriver {
    fn find<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        async move {
            self.begin("find", namespace, &filter, None, None, &options)?;

            let documents = self.select(namespace, &filter, &options)?;

            Ok(match &options.projection {
                Some(projection) => documents
                    .iter()
                    .map(|document| project(document, projection))
                    .collect(),
                None => documents,
            })
        }
        .boxed()
    }

    fn find_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<Option<Document>>> {
        async move {
            self.begin("findOne", namespace, &filter, None, None, &options)?;

            let select = DriverOptions {
                limit: Some(1),
                ..options.clone()
            };
            let document = self.select(namespace, &filter, &select)?.into_iter().next();

            Ok(match (document, &options.projection) {
                (Some(document), Some(projection)) => Some(project(&document, projection)),
                (document, _) => document,
            })
        }
        .boxed()
    }

    fn count<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<u64>> {
        async move {
            self.begin("count", namespace, &filter, None, None, &options)?;

            let count = self.select(namespace, &filter, &options)?.len();

            Ok(u64::try_from(count).unwrap_or(u64::MAX))
        }
        .boxed()
    }

    fn distinct<'a>(
        &'a self,
        namespace: &'a str,
        field: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<Vec<Bson>>> {
        async move {
            self.begin("distinct", namespace, &filter, None, Some(field), &options)?;

            let mut distinct: Vec<Bson> = Vec::new();

            for document in self.select(namespace, &filter, &DriverOptions::default())? {
                for value in values(&document, field) {
                    let items = match value {
                        Bson::Array(items) => items.iter().collect(),
                        value => vec![value],
                    };

                    for item in items {
                        if !distinct.iter().any(|seen| bson_eq(seen, item)) {
                            distinct.push(item.clone());
                        }
                    }
                }
            }

            Ok(distinct)
        }
        .boxed()
    }

    fn delete_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        async move {
            self.begin("deleteOne", namespace, &filter, None, None, &options)?;
            self.delete(namespace, &filter, false)
        }
        .boxed()
    }

    fn delete_many<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        async move {
            self.begin("deleteMany", namespace, &filter, None, None, &options)?;
            self.delete(namespace, &filter, true)
        }
        .boxed()
    }

    fn update_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>> {
        async move {
            self.begin("updateOne", namespace, &filter, Some(&update), None, &options)?;
            self.update(namespace, &filter, &update, &options, false)
        }
        .boxed()
    }

    fn update_many<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>> {
        async move {
            self.begin("updateMany", namespace, &filter, Some(&update), None, &options)?;
            self.update(namespace, &filter, &update, &options, true)
        }
        .boxed()
    }

    fn replace_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        replacement: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>> {
        async move {
            self.begin(
                "replaceOne",
                namespace,
                &filter,
                Some(&replacement),
                None,
                &options,
            )?;

            if path::has_operators(&replacement) {
                return Err(failure("replacement document must not contain update operators"));
            }

            let mut documents = self.collections.entry(namespace.to_owned()).or_default();

            if let Some(index) = Self::position(&documents, &filter, None)? {
                let existing = &mut documents[index];
                let mut replaced = replacement.clone();
                if let Some(id) = existing.get("_id") {
                    replaced.insert("_id", id.clone());
                }
                let modified = replaced != *existing;
                *existing = replaced;

                return Ok(UpdateOutcome {
                    acknowledged: true,
                    matched_count: 1,
                    modified_count: u64::from(modified),
                    upserted_id: None,
                });
            }

            let mut upserted_id = None;
            if options.upsert == Some(true) {
                let mut document = replacement;
                if let Some(id) = filter.get("_id").filter(|id| !is_condition(id)) {
                    document.insert("_id", id.clone());
                }
                upserted_id = Some(ensure_id(&mut document));
                documents.push(document);
            }

            Ok(UpdateOutcome {
                acknowledged: true,
                matched_count: 0,
                modified_count: 0,
                upserted_id,
            })
        }
        .boxed()
    }

    fn find_one_and_update<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<RawModifyResult>> {
        async move {
            self.begin(
                "findOneAndUpdate",
                namespace,
                &filter,
                Some(&update),
                None,
                &options,
            )?;

            let return_new = options.return_new == Some(true);
            let mut documents = self.collections.entry(namespace.to_owned()).or_default();

            let (value, last_error_object) =
                match Self::position(&documents, &filter, options.sort.as_ref())? {
                    Some(index) => {
                        let before = documents[index].clone();
                        let mut after = before.clone();
                        if path::has_operators(&update) {
                            apply_update(&mut after, &update, false)?;
                        } else {
                            after = update.clone();
                            if let Some(id) = before.get("_id") {
                                after.insert("_id", id.clone());
                            }
                        }
                        documents[index] = after.clone();

                        (
                            Some(if return_new { after } else { before }),
                            LastErrorObject {
                                n: 1,
                                updated_existing: Some(true),
                                upserted: None,
                            },
                        )
                    }
                    None if options.upsert == Some(true) => {
                        let mut document = seed_from_filter(&filter);
                        apply_update(&mut document, &update, true)?;
                        let id = ensure_id(&mut document);
                        documents.push(document.clone());

                        (
                            return_new.then_some(document),
                            LastErrorObject {
                                n: 1,
                                updated_existing: Some(false),
                                upserted: Some(id),
                            },
                        )
                    }
                    None => (None, LastErrorObject::default()),
                };

            Ok(RawModifyResult {
                value: value.map(|value| match &options.projection {
                    Some(projection) => project(&value, projection),
                    None => value,
                }),
                last_error_object,
                ok: 1.0,
            })
        }
        .boxed()
    }

    fn find_one_and_delete<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<RawModifyResult>> {
        async move {
            self.begin("findOneAndDelete", namespace, &filter, None, None, &options)?;

            let mut documents = self.collections.entry(namespace.to_owned()).or_default();

            let removed = Self::position(&documents, &filter, options.sort.as_ref())?
                .map(|index| documents.remove(index));

            Ok(RawModifyResult {
                last_error_object: LastErrorObject {
                    n: u64::from(removed.is_some()),
                    ..LastErrorObject::default()
                },
                value: removed.map(|value| match &options.projection {
                    Some(projection) => project(&value, projection),
                    None => value,
                }),
                ok: 1.0,
            })
        }
        .boxed()
    }
}

fn failure(message: impl Into<String>) -> Error {
    Error::Driver(DriverError::message(message))
}

fn ensure_id(document: &mut Document) -> Bson {
    match document.get("_id") {
        Some(id) => id.clone(),
        None => {
            let id = Bson::ObjectId(ObjectId::new());
            let mut with_id = Document::new();
            with_id.insert("_id", id.clone());
            for (key, value) in std::mem::take(document) {
                with_id.insert(key, value);
            }
            *document = with_id;
            id
        }
    }
}

fn is_condition(value: &Bson) -> bool {
    matches!(value, Bson::Document(document) if path::has_operators(document))
}

/// The document an upsert starts from: the equality paths of the filter.
fn seed_from_filter(filter: &Document) -> Document {
    fn collect(filter: &Document, seed: &mut Document) {
        for (key, value) in filter {
            match (key.as_str(), value) {
                ("$and", Bson::Array(clauses)) => {
                    for clause in clauses.iter().filter_map(Bson::as_document) {
                        collect(clause, seed);
                    }
                }
                (key, _) if path::is_operator(key) => {}
                (key, Bson::Document(condition)) if path::has_operators(condition) => {
                    if let Some(value) = condition.get("$eq") {
                        path::set(seed, key, value.clone());
                    }
                }
                (key, value) => path::set(seed, key, value.clone()),
            }
        }
    }

    let mut seed = Document::new();
    collect(filter, &mut seed);
    seed
}

/// Every value reachable through `path`, descending into array elements.
fn values<'a>(document: &'a Document, path: &str) -> Vec<&'a Bson> {
    fn walk<'a>(current: &'a Bson, segments: &[&str], out: &mut Vec<&'a Bson>) {
        let Some((head, rest)) = segments.split_first() else {
            out.push(current);
            return;
        };

        match current {
            Bson::Document(inner) => {
                if let Some(next) = inner.get(*head) {
                    walk(next, rest, out);
                }
            }
            Bson::Array(items) => match head.parse::<usize>() {
                Ok(index) => {
                    if let Some(next) = items.get(index) {
                        walk(next, rest, out);
                    }
                }
                Err(_) => {
                    for item in items {
                        if matches!(item, Bson::Document(_)) {
                            walk(item, segments, out);
                        }
                    }
                }
            },
            _ => {}
        }
    }

    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();

    if let Some((head, rest)) = segments.split_first() {
        if let Some(first) = document.get(*head) {
            walk(first, rest, &mut out);
        }
    }

    out
}

#[allow(clippy::float_cmp)]
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(a), Some(b)) => a == b,
        _ => a == b,
    }
}

fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Null | Bson::Undefined => 0,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 1,
        Bson::String(_) | Bson::Symbol(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::ObjectId(_) => 6,
        Bson::Boolean(_) => 7,
        Bson::DateTime(_) => 8,
        Bson::Timestamp(_) => 9,
        _ => 10,
    }
}

/// Ordering between two values of the same kind; `None` across kinds.
fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::String(a), Bson::String(b)) => Some(a.cmp(b)),
        (Bson::DateTime(a), Bson::DateTime(b)) => Some(a.timestamp_millis().cmp(&b.timestamp_millis())),
        (Bson::ObjectId(a), Bson::ObjectId(b)) => Some(a.bytes().cmp(&b.bytes())),
        (Bson::Boolean(a), Bson::Boolean(b)) => Some(a.cmp(b)),
        _ => as_f64(a)?.partial_cmp(&as_f64(b)?),
    }
}

fn compare_sort_values(a: Option<&Bson>, b: Option<&Bson>) -> Ordering {
    let a = a.unwrap_or(&Bson::Null);
    let b = b.unwrap_or(&Bson::Null);

    compare(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}

fn compare_by_sort(a: &Document, b: &Document, sort: &Document) -> Ordering {
    for (key, direction) in sort {
        let ordering = compare_sort_values(path::get(a, key), path::get(b, key));
        let ordering = if as_f64(direction).is_some_and(|d| d < 0.0) {
            ordering.reverse()
        } else {
            ordering
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    Ordering::Equal
}

fn sort_documents(documents: &mut [Document], sort: &Document) {
    documents.sort_by(|a, b| compare_by_sort(a, b, sort));
}

fn clauses<'a>(operator: &str, value: &'a Bson) -> Result<impl Iterator<Item = &'a Document>> {
    match value {
        Bson::Array(items) => Ok(items.iter().filter_map(Bson::as_document)),
        _ => Err(failure(format!("{operator} argument must be an array"))),
    }
}

fn matches(document: &Document, filter: &Document) -> Result<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    all &= matches(document, clause)?;
                }
                all
            }
            "$or" | "$nor" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    any |= matches(document, clause)?;
                }
                if key == "$or" { any } else { !any }
            }
            "$comment" => true,
            operator if path::is_operator(operator) => {
                return Err(failure(format!("unknown top level operator: {operator}")));
            }
            key => matches_condition(&values(document, key), condition)?,
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

fn equals_any(found: &[&Bson], expected: &Bson) -> bool {
    if found.is_empty() {
        return matches!(expected, Bson::Null);
    }

    found.iter().any(|value| {
        bson_eq(value, expected)
            || matches!(value, Bson::Array(items) if items.iter().any(|item| bson_eq(item, expected)))
    })
}

/// Values and, for arrays, their elements.
fn flatten<'a>(found: &[&'a Bson]) -> Vec<&'a Bson> {
    found
        .iter()
        .flat_map(|value| match value {
            Bson::Array(items) => items.iter().collect(),
            value => vec![*value],
        })
        .collect()
}

fn matches_condition(found: &[&Bson], condition: &Bson) -> Result<bool> {
    let Bson::Document(operators) = condition else {
        return Ok(equals_any(found, condition));
    };

    if !path::has_operators(operators) {
        return Ok(equals_any(found, condition));
    }

    for (operator, operand) in operators {
        let matched = match operator.as_str() {
            "$eq" => equals_any(found, operand),
            "$ne" => !equals_any(found, operand),
            "$gt" | "$gte" | "$lt" | "$lte" => flatten(found).into_iter().any(|value| {
                compare(value, operand).is_some_and(|ordering| match operator.as_str() {
                    "$gt" => ordering == Ordering::Greater,
                    "$gte" => ordering != Ordering::Less,
                    "$lt" => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                })
            }),
            "$in" | "$nin" => {
                let Bson::Array(candidates) = operand else {
                    return Err(failure(format!("{operator} needs an array")));
                };
                let any = candidates.iter().any(|candidate| equals_any(found, candidate));
                if operator == "$in" { any } else { !any }
            }
            "$exists" => {
                let expected = match operand {
                    Bson::Boolean(flag) => *flag,
                    other => as_f64(other).is_some_and(|n| n != 0.0),
                };
                found.is_empty() != expected
            }
            "$size" => {
                let size = as_f64(operand);
                found.iter().any(|value| match value {
                    #[allow(clippy::cast_precision_loss)]
                    Bson::Array(items) => size == Some(items.len() as f64),
                    _ => false,
                })
            }
            "$all" => {
                let Bson::Array(required) = operand else {
                    return Err(failure("$all needs an array"));
                };
                found.iter().any(|value| match value {
                    Bson::Array(items) => required
                        .iter()
                        .all(|wanted| items.iter().any(|item| bson_eq(item, wanted))),
                    _ => false,
                })
            }
            "$elemMatch" => {
                let Bson::Document(inner) = operand else {
                    return Err(failure("$elemMatch needs an object"));
                };
                let mut any = false;
                for value in found {
                    if let Bson::Array(items) = value {
                        for item in items {
                            any |= match item {
                                Bson::Document(element) if !path::has_operators(inner) => {
                                    matches(element, inner)?
                                }
                                item => matches_condition(&[item], operand)?,
                            };
                        }
                    }
                }
                any
            }
            "$not" => !matches_condition(found, operand)?,
            other => return Err(failure(format!("unknown operator: {other}"))),
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    }
}

fn arithmetic(
    operator: &str,
    current: Option<&Bson>,
    operand: &Bson,
    int: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Bson> {
    let zero = Bson::Int32(0);
    let current = current.unwrap_or(&zero);

    if let (Some(a), Some(b)) = (as_i64(current), as_i64(operand)) {
        if let Some(result) = int(a, b) {
            let both_narrow = matches!(current, Bson::Int32(_)) && matches!(operand, Bson::Int32(_));
            return Ok(match i32::try_from(result) {
                Ok(narrow) if both_narrow => Bson::Int32(narrow),
                _ => Bson::Int64(result),
            });
        }
    }

    match (as_f64(current), as_f64(operand)) {
        (Some(a), Some(b)) => Ok(Bson::Double(float(a, b))),
        _ => Err(failure(format!(
            "cannot apply {operator} to a value of non-numeric type"
        ))),
    }
}

fn array_at<'a>(document: &'a mut Document, key: &str) -> Result<&'a mut Vec<Bson>> {
    if path::get(document, key).is_none() {
        path::set(document, key, Bson::Array(Vec::new()));
    }

    let mut segments = key.split('.');
    let mut current = segments
        .next()
        .and_then(|head| document.get_mut(head))
        .ok_or_else(|| failure(format!("path `{key}` not found")))?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get_mut(segment),
            Bson::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get_mut(index)),
            _ => None,
        }
        .ok_or_else(|| failure(format!("path `{key}` not found")))?;
    }

    match current {
        Bson::Array(items) => Ok(items),
        _ => Err(failure(format!("the field `{key}` must be an array"))),
    }
}

/// `$each` modifiers or the value itself.
fn each(operand: &Bson) -> Vec<Bson> {
    match operand {
        Bson::Document(modifiers) => match modifiers.get("$each") {
            Some(Bson::Array(items)) => items.clone(),
            _ => vec![operand.clone()],
        },
        other => vec![other.clone()],
    }
}

fn pull_matches(item: &Bson, condition: &Bson) -> Result<bool> {
    match (item, condition) {
        (_, Bson::Document(operators)) if path::has_operators(operators) => {
            matches_condition(&[item], condition)
        }
        (Bson::Document(element), Bson::Document(filter)) => matches(element, filter),
        _ => Ok(bson_eq(item, condition)),
    }
}

fn apply_update(document: &mut Document, update: &Document, inserting: bool) -> Result<()> {
    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(failure(format!("modifier {operator} expects an object")));
        };

        for (key, operand) in fields {
            match operator.as_str() {
                "$set" => path::set(document, key, operand.clone()),
                "$setOnInsert" => {
                    if inserting {
                        path::set(document, key, operand.clone());
                    }
                }
                "$unset" => {
                    path::remove(document, key);
                }
                "$inc" => {
                    let value = arithmetic(
                        operator,
                        path::get(document, key),
                        operand,
                        i64::checked_add,
                        |a, b| a + b,
                    )?;
                    path::set(document, key, value);
                }
                "$mul" => {
                    let value = arithmetic(
                        operator,
                        path::get(document, key),
                        operand,
                        i64::checked_mul,
                        |a, b| a * b,
                    )?;
                    path::set(document, key, value);
                }
                "$min" | "$max" => {
                    let replace = match path::get(document, key) {
                        None => true,
                        Some(current) => {
                            let ordering = compare_sort_values(Some(operand), Some(current));
                            if operator == "$min" {
                                ordering == Ordering::Less
                            } else {
                                ordering == Ordering::Greater
                            }
                        }
                    };
                    if replace {
                        path::set(document, key, operand.clone());
                    }
                }
                "$rename" => {
                    let Bson::String(target) = operand else {
                        return Err(failure("$rename target must be a string"));
                    };
                    if let Some(value) = path::remove(document, key) {
                        path::set(document, target, value);
                    }
                }
                "$currentDate" => path::set(document, key, Bson::DateTime(bson::DateTime::now())),
                "$push" => array_at(document, key)?.extend(each(operand)),
                "$addToSet" => {
                    let items = array_at(document, key)?;
                    for value in each(operand) {
                        if !items.iter().any(|item| bson_eq(item, &value)) {
                            items.push(value);
                        }
                    }
                }
                "$pull" => {
                    let items = array_at(document, key)?;
                    let mut kept = Vec::with_capacity(items.len());
                    for item in items.drain(..) {
                        if !pull_matches(&item, operand)? {
                            kept.push(item);
                        }
                    }
                    *items = kept;
                }
                "$pullAll" => {
                    let Bson::Array(removed) = operand else {
                        return Err(failure("$pullAll requires an array argument"));
                    };
                    array_at(document, key)?
                        .retain(|item| !removed.iter().any(|value| bson_eq(item, value)));
                }
                other => return Err(failure(format!("unknown modifier: {other}"))),
            }
        }
    }

    Ok(())
}

fn truthy(value: &Bson) -> Option<bool> {
    match value {
        Bson::Boolean(flag) => Some(*flag),
        other => as_f64(other).map(|n| n != 0.0),
    }
}

fn slice(items: &[Bson], directive: &Bson) -> Vec<Bson> {
    let len = items.len();

    let clamp = |n: i64| -> usize {
        usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX).min(len)
    };

    match directive {
        Bson::Array(range) => {
            let skip = range.first().and_then(as_i64).unwrap_or_default();
            let limit = range.get(1).and_then(as_i64).unwrap_or_default();
            let start = if skip < 0 { len - clamp(skip) } else { clamp(skip) };
            items.iter().skip(start).take(clamp(limit)).cloned().collect()
        }
        count => match as_i64(count) {
            Some(n) if n < 0 => items[len - clamp(n)..].to_vec(),
            Some(n) => items[..clamp(n)].to_vec(),
            None => items.to_vec(),
        },
    }
}

/// Applies an inclusion or exclusion projection, honoring `$slice` directives.
fn project(document: &Document, projection: &Document) -> Document {
    let inclusive = projection
        .iter()
        .any(|(key, value)| key != "_id" && truthy(value) == Some(true));

    let mut projected = if inclusive {
        let mut projected = Document::new();

        if projection.get("_id").and_then(truthy) != Some(false) {
            if let Some(id) = document.get("_id") {
                projected.insert("_id", id.clone());
            }
        }

        for (key, value) in projection {
            let included = truthy(value) == Some(true) || matches!(value, Bson::Document(_));
            if key != "_id" && included {
                if let Some(found) = path::get(document, key) {
                    path::set(&mut projected, key, found.clone());
                }
            }
        }

        projected
    } else {
        let mut projected = document.clone();

        for (key, value) in projection {
            if truthy(value) == Some(false) {
                path::remove(&mut projected, key);
            }
        }

        projected
    };

    for (key, value) in projection {
        if let Some(directive) = value.as_document().and_then(|value| value.get("$slice")) {
            if let Some(Bson::Array(items)) = path::get(&projected, key) {
                let sliced = slice(items, directive);
                path::set(&mut projected, key, Bson::Array(sliced));
            }
        }
    }

    projected
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn people() -> Vec<Document> {
        vec![
            doc! { "_id": 1, "name": "ann", "age": 31, "tags": ["a", "b"] },
            doc! { "_id": 2, "name": "bob", "age": 17, "tags": ["b"] },
            doc! { "_id": 3, "name": "cat", "tags": [] },
        ]
    }

    fn ids(documents: &[Document]) -> Vec<i32> {
        documents
            .iter()
            .filter_map(|document| document.get_i32("_id").ok())
            .collect()
    }

    fn select_ids(filter: Document) -> Vec<i32> {
        let matched: Vec<Document> = people()
            .into_iter()
            .filter(|document| matches(document, &filter).unwrap())
            .collect();
        ids(&matched)
    }

    #[test]
    fn comparison_operators() {
        assert_eq!(select_ids(doc! { "age": { "$gte": 18 } }), vec![1]);
        assert_eq!(select_ids(doc! { "age": { "$ne": 17 } }), vec![1, 3]);
        assert_eq!(select_ids(doc! { "age": { "$exists": false } }), vec![3]);
        assert_eq!(select_ids(doc! { "name": { "$in": ["bob", "cat"] } }), vec![2, 3]);
        assert_eq!(select_ids(doc! { "age": 31.0 }), vec![1]);
    }

    #[test]
    fn array_operators() {
        assert_eq!(select_ids(doc! { "tags": "b" }), vec![1, 2]);
        assert_eq!(select_ids(doc! { "tags": { "$size": 0 } }), vec![3]);
        assert_eq!(select_ids(doc! { "tags": { "$all": ["a", "b"] } }), vec![1]);
    }

    #[test]
    fn logical_operators() {
        assert_eq!(select_ids(doc! { "$or": [ { "name": "ann" }, { "age": { "$lt": 18 } } ] }),
            vec![1, 2]
        );
        assert_eq!(select_ids(doc! { "$nor": [ { "name": "ann" } ], "$and": [ { "tags": "b" } ] }),
            vec![2]
        );
    }

    #[test]
    fn unknown_operator_is_a_driver_error() {
        let error = matches(&doc! {}, &doc! { "a": { "$bogus": 1 } }).unwrap_err();
        assert!(matches!(error, Error::Driver(_)));
    }

    #[test]
    fn update_operators() {
        let mut document = doc! { "n": 1, "tags": ["a"] };

        apply_update(
            &mut document,
            &doc! {
                "$inc": { "n": 2 },
                "$addToSet": { "tags": { "$each": ["a", "b"] } },
                "$setOnInsert": { "created": true },
                "$set": { "meta.seen": true },
            },
            false,
        )
        .unwrap();

        assert_eq!(
            document,
            doc! { "n": 3, "tags": ["a", "b"], "meta": { "seen": true } }
        );
    }

    #[test]
    fn upsert_seed_takes_filter_equalities() {
        let seed = seed_from_filter(&doc! {
            "name": "ann",
            "age": { "$gt": 3 },
            "$and": [ { "kind": "Admin" } ],
        });

        assert_eq!(seed, doc! { "name": "ann", "kind": "Admin" });
    }

    #[test]
    fn projection_modes() {
        let document = doc! { "_id": 1, "name": "ann", "age": 31, "tags": [1, 2, 3, 4] };

        assert_eq!(
            project(&document, &doc! { "name": 1, "_id": 0 }),
            doc! { "name": "ann" }
        );
        assert_eq!(
            project(&document, &doc! { "age": 0, "tags": { "$slice": -2 } }),
            doc! { "_id": 1, "name": "ann", "tags": [3, 4] }
        );
        assert_eq!(
            project(&document, &doc! { "tags": { "$slice": [1, 2] } }),
            doc! { "_id": 1, "name": "ann", "age": 31, "tags": [2, 3] }
        );
    }

    #[tokio::test]
    async fn find_sorts_skips_and_limits() {
        let driver = MemoryDriver::new();
        driver.insert_many("people", people());

        let found = driver
            .find(
                "people",
                doc! {},
                DriverOptions {
                    sort: Some(doc! { "name": -1 }),
                    skip: Some(1),
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(ids(&found), vec![2]);
        assert_eq!(driver.calls()[0].method, "find");
    }

    #[tokio::test]
    async fn find_one_and_update_envelope() {
        let driver = MemoryDriver::new();
        driver.insert_many("people", people());

        let raw = driver
            .find_one_and_update(
                "people",
                doc! { "name": "zed" },
                doc! { "$set": { "age": 40 } },
                DriverOptions {
                    upsert: Some(true),
                    return_new: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let value = raw.value.unwrap();
        assert_eq!(value.get_str("name").unwrap(), "zed");
        assert_eq!(value.get_i32("age").unwrap(), 40);
        assert_eq!(raw.last_error_object.n, 1);
        assert_eq!(raw.last_error_object.updated_existing, Some(false));
        assert!(raw.last_error_object.upserted.is_some());
        assert_eq!(driver.documents("people").len(), 4);
    }

    #[tokio::test]
    async fn injected_failure_is_recorded_then_returned() {
        let driver = MemoryDriver::new();
        driver.fail_next(DriverError::message("socket closed"));

        let error = driver
            .count("people", doc! {}, DriverOptions::default())
            .await
            .unwrap_err();

        assert_eq!(error.to_string(), "driver error: socket closed");
        assert_eq!(driver.calls().len(), 1);
        assert!(driver.count("people", doc! {}, DriverOptions::default()).await.is_ok());
    }
}
