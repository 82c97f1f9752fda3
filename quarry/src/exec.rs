//! Dispatch: turning a declared [`Query`] into a driver call.

use crate::{
    Error, Result, cast,
    driver::{DeleteOutcome, DriverOptions, RawModifyResult, UpdateOutcome},
    hydrate::{self, HydrationContext, Outcome, Record},
    model::Model,
    normalize, options,
    query::{Operation, Query},
};
use futures_util::{FutureExt, future::BoxFuture};
use mongodb::bson::Document;
use std::time::Instant;

impl<T: Model> Query<T> {
    /// Sends the declared operation and delivers its result.
    ///
    /// A pending error is returned without contacting the driver. Cast and
    /// validation failures found while preparing the request are recorded on
    /// the builder, so a second `exec` fails the same way until the error is
    /// cleared with [`Query::set_error`].
    pub fn exec(&mut self) -> BoxFuture<'_, Result<Outcome<T>>> {
        async move {
            self.status.clone()?;

            let operation = self.op.ok_or_else(|| {
                Error::shape("operation", "Query::exec", "no operation has been declared")
            })?;

            let model = T::schema().name();
            tracing::debug!(model, operation = operation.name(), "dispatching query");

            let started = Instant::now();
            let result = self.dispatch(operation).await;
            let elapsed = started.elapsed();

            if let Some(threshold) = self.connection.config().slow_query_threshold {
                if elapsed > threshold {
                    tracing::warn!(
                        target: "quarry::slow_query",
                        model,
                        operation = operation.name(),
                        elapsed = ?elapsed,
                        "slow query"
                    );
                }
            }

            match result {
                Err(
                    error @ (Error::Cast(_) | Error::StrictMode { .. } | Error::Validation(_)),
                ) => {
                    self.status = Err(error.clone());
                    Err(error)
                }
                result => result,
            }
        }
        .boxed()
    }

    async fn dispatch(&self, operation: Operation) -> Result<Outcome<T>> {
        let driver = self.connection.driver();
        let namespace = T::COLLECTION_NAME;
        let filter = self.cast()?;

        match operation {
            Operation::Find => {
                let projection = self.effective_projection();
                let options = DriverOptions {
                    projection: projection.clone(),
                    ..self.read_options()
                };

                let records = driver.find(namespace, filter, options).await?;
                Ok(Outcome::Many(self.deliver(records, projection).await?))
            }
            Operation::FindOne => {
                let projection = self.effective_projection();
                let options = DriverOptions {
                    projection: projection.clone(),
                    ..self.read_options()
                };

                let record = driver.find_one(namespace, filter, options).await?;
                Ok(Outcome::One(self.deliver_one(record, projection).await?))
            }
            Operation::Count => {
                let options = DriverOptions {
                    sort: None,
                    batch_size: None,
                    ..self.read_options()
                };

                Ok(Outcome::Count(driver.count(namespace, filter, options).await?))
            }
            Operation::Distinct => {
                let field = self.distinct_field.as_deref().ok_or_else(|| {
                    Error::shape("field", "Query::distinct", "no distinct field has been set")
                })?;
                let options = DriverOptions {
                    read_preference: self.options.read_preference.clone(),
                    ..self.base_options()
                };

                let values = driver.distinct(namespace, field, filter, options).await?;
                Ok(Outcome::Distinct(values))
            }
            Operation::Remove | Operation::DeleteOne | Operation::DeleteMany => {
                let single = match operation {
                    Operation::DeleteOne => true,
                    Operation::DeleteMany => false,
                    _ => self.options.single == Some(true),
                };

                let outcome = if single {
                    driver.delete_one(namespace, filter, self.base_options()).await?
                } else {
                    driver.delete_many(namespace, filter, self.base_options()).await?
                };

                self.deleted(outcome)
            }
            Operation::Update
            | Operation::UpdateOne
            | Operation::UpdateMany
            | Operation::ReplaceOne => self.dispatch_update(operation, filter).await,
            Operation::FindOneAndUpdate => self.dispatch_find_and_update(filter).await,
            Operation::FindOneAndRemove => {
                let options = DriverOptions {
                    projection: self.effective_projection(),
                    sort: self.sort_document(),
                    ..self.base_options()
                };

                let raw = driver.find_one_and_delete(namespace, filter, options).await?;
                self.modified(raw).await
            }
        }
    }

    async fn dispatch_update(&self, operation: Operation, filter: Document) -> Result<Outcome<T>> {
        let driver = self.connection.driver();
        let namespace = T::COLLECTION_NAME;

        let options = DriverOptions {
            upsert: self.options.upsert,
            array_filters: self.options.array_filters.clone(),
            ..self.base_options()
        };

        let overwrite = match operation {
            Operation::ReplaceOne => true,
            Operation::Update | Operation::UpdateOne => self.options.overwrite == Some(true),
            _ => false,
        };

        if overwrite {
            if self.update.is_empty() {
                return Ok(Outcome::Updated(UpdateOutcome::unacknowledged()));
            }

            let replacement = cast::cast_replacement(
                T::schema(),
                &self.update,
                self.strict(),
                self.omits_undefined(),
            )?;

            let outcome = driver.replace_one(namespace, filter, replacement, options).await?;
            return self.updated(outcome);
        }

        let mut update = self.cast_update()?;
        self.finish_update(&filter, &mut update)?;

        if update.is_empty() {
            if self.options.upsert != Some(true) {
                tracing::debug!(
                    model = T::schema().name(),
                    operation = operation.name(),
                    "empty update, nothing sent"
                );
                return Ok(Outcome::Updated(UpdateOutcome::unacknowledged()));
            }

            // Upserts the filter-seeded document.
            update.insert("$setOnInsert", Document::new());
        }

        let many = match operation {
            Operation::UpdateMany => true,
            Operation::Update => self.options.multi == Some(true),
            _ => false,
        };

        let outcome = if many {
            driver.update_many(namespace, filter, update, options).await?
        } else {
            driver.update_one(namespace, filter, update, options).await?
        };

        self.updated(outcome)
    }

    async fn dispatch_find_and_update(&self, filter: Document) -> Result<Outcome<T>> {
        let driver = self.connection.driver();
        let namespace = T::COLLECTION_NAME;
        let projection = self.effective_projection();

        let overwrite = self.options.overwrite == Some(true);
        let mut update = if overwrite && !self.update.is_empty() {
            cast::cast_replacement(
                T::schema(),
                &self.update,
                self.strict(),
                self.omits_undefined(),
            )?
        } else if overwrite {
            Document::new()
        } else {
            self.cast_update()?
        };

        if update.is_empty() && self.options.upsert != Some(true) {
            let options = DriverOptions {
                projection: projection.clone(),
                sort: self.sort_document(),
                ..self.base_options()
            };
            let record = driver.find_one(namespace, filter, options).await?;

            if self.options.raw_result == Some(true) {
                let raw = RawModifyResult {
                    value: record,
                    ok: 1.0,
                    ..RawModifyResult::default()
                };
                return self.modified(raw).await;
            }

            return Ok(Outcome::One(self.deliver_one(record, projection).await?));
        }

        if !overwrite {
            self.finish_update(&filter, &mut update)?;
        }

        let options = DriverOptions {
            projection,
            sort: self.sort_document(),
            upsert: self.options.upsert,
            return_new: self.options.new,
            array_filters: self.options.array_filters.clone(),
            ..self.base_options()
        };

        let raw = driver
            .find_one_and_update(namespace, filter, update, options)
            .await?;
        self.modified(raw).await
    }

    fn cast_update(&self) -> Result<Document> {
        cast::cast_update(
            T::schema(),
            &self.update,
            self.strict(),
            self.omits_undefined(),
        )
    }

    /// Applies defaults on insert, then runs update validators if enabled.
    fn finish_update(&self, filter: &Document, update: &mut Document) -> Result<()> {
        let schema = T::schema();

        if self.options.upsert == Some(true) && self.options.set_defaults_on_insert == Some(true) {
            cast::apply_defaults_on_insert(schema, filter, update);
        }

        let run_validators = self
            .options
            .run_validators
            .unwrap_or(self.connection.config().run_validators);

        if run_validators {
            let context = self.options.context.unwrap_or_default();
            cast::validate_update(schema, update, context)?;
        }

        Ok(())
    }

    fn omits_undefined(&self) -> bool {
        self.builder_options.omit_undefined.unwrap_or(false)
    }

    fn fails_when_empty(&self) -> bool {
        self.builder_options.or_fail == Some(true)
    }

    fn not_found(&self) -> Error {
        Error::DocumentNotFound {
            model: T::schema().name(),
        }
    }

    fn effective_projection(&self) -> Option<Document> {
        normalize::effective_projection(T::schema(), self.fields.as_ref(), &self.forced_includes)
    }

    fn sort_document(&self) -> Option<Document> {
        self.options.sort.as_deref().map(options::sort_document)
    }

    /// Options every driver call carries.
    fn base_options(&self) -> DriverOptions {
        DriverOptions {
            collation: self.options.collation.clone(),
            max_time: self.options.max_time,
            comment: self.options.comment.clone(),
            extra: self.options.extra.clone(),
            ..DriverOptions::default()
        }
    }

    fn read_options(&self) -> DriverOptions {
        DriverOptions {
            sort: self.sort_document(),
            limit: self.options.limit,
            skip: self.options.skip,
            read_preference: self.options.read_preference.clone(),
            batch_size: self.options.batch_size,
            ..self.base_options()
        }
    }

    fn deleted(&self, outcome: DeleteOutcome) -> Result<Outcome<T>> {
        if self.fails_when_empty() && outcome.deleted_count == 0 {
            return Err(self.not_found());
        }
        Ok(Outcome::Deleted(outcome))
    }

    fn updated(&self, outcome: UpdateOutcome) -> Result<Outcome<T>> {
        if self.fails_when_empty() && outcome.matched_count == 0 && outcome.upserted_id.is_none() {
            return Err(self.not_found());
        }
        Ok(Outcome::Updated(outcome))
    }

    async fn modified(&self, raw: RawModifyResult) -> Result<Outcome<T>> {
        if self.options.raw_result == Some(true) {
            if self.fails_when_empty() && raw.value.is_none() {
                return Err(self.not_found());
            }
            return Ok(Outcome::Raw(raw));
        }

        let projection = self.effective_projection();
        Ok(Outcome::One(self.deliver_one(raw.value, projection).await?))
    }

    /// Populates, then hydrates unless lean.
    async fn deliver(
        &self,
        records: Vec<Document>,
        projection: Option<Document>,
    ) -> Result<Vec<Record<T>>> {
        let directives = &self.builder_options.populate;

        let records = if directives.is_empty() || records.is_empty() {
            records
        } else {
            self.connection
                .populator()
                .populate(T::schema(), records, directives)
                .await?
        };

        let context = HydrationContext {
            projection,
            user_projection: self.fields.clone(),
            populated: directives.iter().map(|directive| directive.path.clone()).collect(),
        };

        let lean = self.builder_options.lean.unwrap_or(false);
        hydrate::deliver(records, lean, &context).await
    }

    async fn deliver_one(
        &self,
        record: Option<Document>,
        projection: Option<Document>,
    ) -> Result<Option<Record<T>>> {
        match record {
            Some(record) => Ok(self.deliver(vec![record], projection).await?.into_iter().next()),
            None if self.fails_when_empty() => Err(self.not_found()),
            None => Ok(None),
        }
    }
}
