use super::{DeleteOutcome, Driver, DriverOptions, RawModifyResult, UpdateOutcome};
use crate::{
    DriverError, Error, Result,
    options::{ReadMode, ReadPreference},
};
use futures_util::{FutureExt, TryStreamExt, future::BoxFuture};
use mongodb::{
    Collection, Database,
    bson::{self, Bson, Document, doc},
    options::{
        Collation, CountOptions, DeleteOptions, DistinctOptions, FindOneOptions, FindOptions,
        ReadPreference as DriverReadPreference, ReadPreferenceOptions, ReplaceOptions,
        SelectionCriteria, UpdateOptions,
    },
};

/// [`Driver`] backed by the official `mongodb` crate.
///
/// Find-and-modify calls are issued as raw `findAndModify` commands so the
/// whole reply envelope is available for `rawResult` queries.
#[derive(Clone, Debug)]
pub struct MongoDriver {
    db: Database,
}

impl MongoDriver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn collection(&self, namespace: &str) -> Collection<Document> {
        self.db.collection(namespace)
    }
}

impl From<Database> for MongoDriver {
    fn from(db: Database) -> Self {
        Self::new(db)
    }
}

fn collation(options: &DriverOptions) -> Result<Option<Collation>> {
    options
        .collation
        .clone()
        .map(bson::from_document::<Collation>)
        .transpose()
        .map_err(|err| Error::shape("collation", "MongoDriver", err.to_string()))
}

fn selection_criteria(options: &DriverOptions) -> Option<SelectionCriteria> {
    let preference: &ReadPreference = options.read_preference.as_ref()?;

    let tagged = || {
        if preference.tag_sets.is_empty() {
            ReadPreferenceOptions::builder().build()
        } else {
            ReadPreferenceOptions::builder()
                .tag_sets(preference.tag_sets.clone())
                .build()
        }
    };

    let preference = match preference.mode {
        ReadMode::Primary => DriverReadPreference::Primary,
        ReadMode::PrimaryPreferred => DriverReadPreference::PrimaryPreferred {
            options: tagged().into(),
        },
        ReadMode::Secondary => DriverReadPreference::Secondary {
            options: tagged().into(),
        },
        ReadMode::SecondaryPreferred => DriverReadPreference::SecondaryPreferred {
            options: tagged().into(),
        },
        ReadMode::Nearest => DriverReadPreference::Nearest {
            options: tagged().into(),
        },
    };

    Some(SelectionCriteria::ReadPreference(preference))
}

fn millis(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Appends the options every command accepts, `extra` last so it can
/// override anything translated before it.
fn finish_command(command: &mut Document, options: DriverOptions) {
    if let Some(collation) = options.collation {
        command.insert("collation", collation);
    }
    if let Some(max_time) = options.max_time {
        command.insert("maxTimeMS", millis(max_time));
    }
    if let Some(comment) = options.comment {
        command.insert("comment", comment);
    }
    for (key, value) in options.extra {
        command.insert(key, value);
    }
}

/// Builds a `findAndModify` command from the translated options.
fn find_and_modify(
    namespace: &str,
    filter: Document,
    update: Option<Document>,
    options: DriverOptions,
) -> Document {
    let mut command = doc! { "findAndModify": namespace, "query": filter };

    match update {
        Some(update) => {
            command.insert("update", update);
            if let Some(new) = options.return_new {
                command.insert("new", new);
            }
            if let Some(upsert) = options.upsert {
                command.insert("upsert", upsert);
            }
            if let Some(array_filters) = options.array_filters.clone() {
                command.insert("arrayFilters", array_filters);
            }
        }
        None => {
            command.insert("remove", true);
        }
    }

    if let Some(sort) = options.sort.clone() {
        command.insert("sort", sort);
    }
    if let Some(projection) = options.projection.clone() {
        command.insert("fields", projection);
    }

    finish_command(&mut command, options);
    command
}

fn find_command(namespace: &str, filter: Document, options: DriverOptions) -> Document {
    let mut command = doc! { "find": namespace, "filter": filter };

    if let Some(projection) = options.projection.clone() {
        command.insert("projection", projection);
    }
    if let Some(sort) = options.sort.clone() {
        command.insert("sort", sort);
    }
    if let Some(skip) = options.skip {
        command.insert("skip", i64::try_from(skip).unwrap_or(i64::MAX));
    }
    if let Some(limit) = options.limit {
        command.insert("limit", limit.abs());
        if limit < 0 {
            command.insert("singleBatch", true);
        }
    }
    if let Some(batch_size) = options.batch_size {
        command.insert("batchSize", i64::from(batch_size));
    }

    finish_command(&mut command, options);
    command
}

/// `count_documents` as the aggregation it stands for.
fn count_command(namespace: &str, filter: Document, options: DriverOptions) -> Document {
    let mut pipeline = vec![doc! { "$match": filter }];
    if let Some(skip) = options.skip {
        pipeline.push(doc! { "$skip": i64::try_from(skip).unwrap_or(i64::MAX) });
    }
    if let Some(limit) = options.limit {
        pipeline.push(doc! { "$limit": limit.abs() });
    }
    pipeline.push(doc! { "$group": { "_id": 1, "n": { "$sum": 1 } } });

    let mut command = doc! { "aggregate": namespace, "pipeline": pipeline, "cursor": {} };
    finish_command(&mut command, options);
    command
}

fn distinct_command(
    namespace: &str,
    field: &str,
    filter: Document,
    options: DriverOptions,
) -> Document {
    let mut command = doc! { "distinct": namespace, "key": field, "query": filter };
    finish_command(&mut command, options);
    command
}

fn delete_command(
    namespace: &str,
    filter: Document,
    many: bool,
    options: DriverOptions,
) -> Document {
    let mut statement = doc! { "q": filter, "limit": i32::from(!many) };
    if let Some(collation) = options.collation.clone() {
        statement.insert("collation", collation);
    }

    let mut command = doc! { "delete": namespace, "deletes": [statement] };
    finish_command(
        &mut command,
        DriverOptions {
            collation: None,
            ..options
        },
    );
    command
}

fn update_command(
    namespace: &str,
    filter: Document,
    update: Document,
    many: bool,
    options: DriverOptions,
) -> Document {
    let mut statement = doc! { "q": filter, "u": update, "multi": many };
    if let Some(upsert) = options.upsert {
        statement.insert("upsert", upsert);
    }
    if let Some(array_filters) = options.array_filters.clone() {
        statement.insert("arrayFilters", array_filters);
    }
    if let Some(collation) = options.collation.clone() {
        statement.insert("collation", collation);
    }

    let mut command = doc! { "update": namespace, "updates": [statement] };
    finish_command(
        &mut command,
        DriverOptions {
            collation: None,
            ..options
        },
    );
    command
}

fn reply_count(reply: &Document, key: &str) -> u64 {
    match reply.get(key) {
        Some(Bson::Int32(n)) => u64::try_from(*n).unwrap_or_default(),
        Some(Bson::Int64(n)) => u64::try_from(*n).unwrap_or_default(),
        _ => 0,
    }
}

/// Surfaces `writeErrors` that a raw write command reports with `ok: 1`.
fn write_errors(reply: &Document) -> Result<()> {
    match reply.get_array("writeErrors") {
        Ok(errors) if !errors.is_empty() => Err(DriverError::message(format!(
            "write command failed: {}",
            Bson::Array(errors.clone())
        ))
        .into()),
        _ => Ok(()),
    }
}

fn update_outcome(reply: &Document) -> Result<UpdateOutcome> {
    write_errors(reply)?;

    let upserted_id = reply
        .get_array("upserted")
        .ok()
        .and_then(|upserted| upserted.first())
        .and_then(|entry| entry.as_document())
        .and_then(|entry| entry.get("_id"))
        .cloned();
    let n = reply_count(reply, "n");

    Ok(UpdateOutcome {
        acknowledged: true,
        matched_count: if upserted_id.is_some() { n.saturating_sub(1) } else { n },
        modified_count: reply_count(reply, "nModified"),
        upserted_id,
    })
}

fn delete_outcome(reply: &Document) -> Result<DeleteOutcome> {
    write_errors(reply)?;

    Ok(DeleteOutcome {
        acknowledged: true,
        deleted_count: reply_count(reply, "n"),
    })
}

impl Driver for MongoDriver {
    fn find<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<Vec<Document>>> {
        async move {
            if !options.extra.is_empty() {
                let criteria = selection_criteria(&options);
                let command = find_command(namespace, filter, options);
                return self.cursor_command(command, criteria).await;
            }

            let mut find_options = FindOptions::default();
            find_options.collation = collation(&options)?;
            find_options.selection_criteria = selection_criteria(&options);
            find_options.projection = options.projection;
            find_options.sort = options.sort;
            find_options.limit = options.limit;
            find_options.skip = options.skip;
            find_options.max_time = options.max_time;
            find_options.batch_size = options.batch_size;
            find_options.comment = options.comment;

            let documents = self
                .collection(namespace)
                .find(filter)
                .with_options(find_options)
                .await?
                .try_collect()
                .await?;

            Ok(documents)
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
            if !options.extra.is_empty() {
                let criteria = selection_criteria(&options);
                let command = find_command(
                    namespace,
                    filter,
                    DriverOptions {
                        limit: Some(-1),
                        batch_size: None,
                        ..options
                    },
                );
                let documents = self.cursor_command(command, criteria).await?;
                return Ok(documents.into_iter().next());
            }

            let mut find_options = FindOneOptions::default();
            find_options.collation = collation(&options)?;
            find_options.selection_criteria = selection_criteria(&options);
            find_options.projection = options.projection;
            find_options.sort = options.sort;
            find_options.skip = options.skip;
            find_options.max_time = options.max_time;
            find_options.comment = options.comment;

            let document = self
                .collection(namespace)
                .find_one(filter)
                .with_options(find_options)
                .await?;

            Ok(document)
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
            if !options.extra.is_empty() {
                let criteria = selection_criteria(&options);
                let command = count_command(namespace, filter, options);
                let groups = self.cursor_command(command, criteria).await?;
                return Ok(groups.first().map_or(0, |group| reply_count(group, "n")));
            }

            let mut count_options = CountOptions::default();
            count_options.collation = collation(&options)?;
            count_options.selection_criteria = selection_criteria(&options);
            count_options.limit = options.limit.and_then(|limit| u64::try_from(limit).ok());
            count_options.skip = options.skip;
            count_options.max_time = options.max_time;
            count_options.comment = options.comment;

            let count = self
                .collection(namespace)
                .count_documents(filter)
                .with_options(count_options)
                .await?;

            Ok(count)
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
            if !options.extra.is_empty() {
                let criteria = selection_criteria(&options);
                let command = distinct_command(namespace, field, filter, options);
                let reply = self.command(command, criteria).await?;
                return Ok(reply.get_array("values").cloned().unwrap_or_default());
            }

            let mut distinct_options = DistinctOptions::default();
            distinct_options.collation = collation(&options)?;
            distinct_options.selection_criteria = selection_criteria(&options);
            distinct_options.max_time = options.max_time;
            distinct_options.comment = options.comment;

            let values = self
                .collection(namespace)
                .distinct(field, filter)
                .with_options(distinct_options)
                .await?;

            Ok(values)
        }
        .boxed()
    }

    fn delete_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        self.delete(namespace, filter, false, options)
    }

    fn delete_many<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        self.delete(namespace, filter, true, options)
    }

    fn update_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>> {
        self.update(namespace, filter, update, false, options)
    }

    fn update_many<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>> {
        self.update(namespace, filter, update, true, options)
    }

    fn replace_one<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        replacement: Document,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>> {
        async move {
            if !options.extra.is_empty() {
                let command = update_command(namespace, filter, replacement, false, options);
                let reply = self.command(command, None).await?;
                return update_outcome(&reply);
            }

            let mut replace_options = ReplaceOptions::default();
            replace_options.collation = collation(&options)?;
            replace_options.upsert = options.upsert;
            replace_options.comment = options.comment;

            let result = self
                .collection(namespace)
                .replace_one(filter, replacement)
                .with_options(replace_options)
                .await?;

            Ok(UpdateOutcome {
                acknowledged: true,
                matched_count: result.matched_count,
                modified_count: result.modified_count,
                upserted_id: result.upserted_id,
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
            let command = find_and_modify(namespace, filter, Some(update), options);
            let reply = self.db.run_command(command).await?;

            Ok(RawModifyResult::from_command_reply(reply))
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
            let command = find_and_modify(namespace, filter, None, options);
            let reply = self.db.run_command(command).await?;

            Ok(RawModifyResult::from_command_reply(reply))
        }
        .boxed()
    }
}

impl MongoDriver {
    /// Runs `command` on the server picked by `criteria`.
    async fn command(
        &self,
        command: Document,
        criteria: Option<SelectionCriteria>,
    ) -> Result<Document> {
        let reply = match criteria {
            Some(criteria) => self.db.run_command(command).selection_criteria(criteria).await?,
            None => self.db.run_command(command).await?,
        };

        Ok(reply)
    }

    async fn cursor_command(
        &self,
        command: Document,
        criteria: Option<SelectionCriteria>,
    ) -> Result<Vec<Document>> {
        let cursor = match criteria {
            Some(criteria) => {
                self.db
                    .run_cursor_command(command)
                    .selection_criteria(criteria)
                    .await?
            }
            None => self.db.run_cursor_command(command).await?,
        };

        Ok(cursor.try_collect().await?)
    }

    fn delete<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        many: bool,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<DeleteOutcome>> {
        async move {
            if !options.extra.is_empty() {
                let command = delete_command(namespace, filter, many, options);
                let reply = self.command(command, None).await?;
                return delete_outcome(&reply);
            }

            let mut delete_options = DeleteOptions::default();
            delete_options.collation = collation(&options)?;
            delete_options.comment = options.comment;

            let collection = self.collection(namespace);
            let result = if many {
                collection.delete_many(filter).with_options(delete_options).await?
            } else {
                collection.delete_one(filter).with_options(delete_options).await?
            };

            Ok(DeleteOutcome {
                acknowledged: true,
                deleted_count: result.deleted_count,
            })
        }
        .boxed()
    }

    fn update<'a>(
        &'a self,
        namespace: &'a str,
        filter: Document,
        update: Document,
        many: bool,
        options: DriverOptions,
    ) -> BoxFuture<'a, Result<UpdateOutcome>> {
        async move {
            if !options.extra.is_empty() {
                let command = update_command(namespace, filter, update, many, options);
                let reply = self.command(command, None).await?;
                return update_outcome(&reply);
            }

            let mut update_options = UpdateOptions::default();
            update_options.collation = collation(&options)?;
            update_options.upsert = options.upsert;
            update_options.array_filters = options.array_filters;
            update_options.comment = options.comment;

            let collection = self.collection(namespace);
            let result = if many {
                collection.update_many(filter, update).with_options(update_options).await?
            } else {
                collection.update_one(filter, update).with_options(update_options).await?
            };

            Ok(UpdateOutcome {
                acknowledged: true,
                matched_count: result.matched_count,
                modified_count: result.modified_count,
                upserted_id: result.upserted_id,
            })
        }
        .boxed()
    }
}
