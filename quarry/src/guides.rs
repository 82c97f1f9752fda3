/// ## Getting started
///
/// The [`Model`](crate::Model) trait maps a Rust type to a collection and
/// describes its fields with a [`Schema`](crate::Schema). Values in filters
/// and updates are cast to the declared field types before anything is sent.
///
/// A type that derives [`Model`](crate::Model) must:
/// - be a struct with named fields and no generic parameters
/// - implement [`Deserialize`](serde::Deserialize)
///
/// ### Example
///
/// ```rust,ignore
/// use quarry::{Model, bson::oid::ObjectId};
/// use serde::Deserialize;
///
/// #[derive(Deserialize, Model)]
/// #[model(collection = "users")]
/// struct User {
///   #[serde(rename = "_id")]
///   id: ObjectId,
///   #[model(required)]
///   name: String,
///   #[model(min = 0, max = 150)]
///   age: i32,
///   #[model(hidden)]
///   password: String,
/// }
/// ```
///
/// By default the collection name is the `snake_case` form of the struct name
/// (e.g., `UserProfile` → `user_profile`). Override it with
/// `#[model(collection = "custom_name")]`.
///
/// | Rust type                              | Field type               |
/// |----------------------------------------|--------------------------|
/// | `String`, `&str`                       | `FieldType::String`      |
/// | integers, `f32`, `f64`                 | `FieldType::Number`      |
/// | `bool`                                 | `FieldType::Boolean`     |
/// | `ObjectId`                             | `FieldType::ObjectId`    |
/// | `DateTime<..>`                         | `FieldType::Date`        |
/// | `Vec<T>`                               | `FieldType::Array(T)`    |
/// | `Option<T>`, `Box<T>`                  | same as `T`              |
/// | anything else                          | `FieldType::Mixed`       |
///
/// ### Creating a `Connection`
///
/// [`Connection`](crate::Connection) bundles a [`Driver`](crate::Driver), a
/// [`Populate`](crate::Populate) resolver and a [`Config`](crate::Config).
///
/// ```rust,ignore
/// let client = Client::with_uri_str("mongodb://example.com").await?;
/// let connection = Connection::mongo(client.database("mydb"))
///     .with_config(Config { strict_query: true, ..Config::default() });
/// ```
///
/// For tests, [`MemoryDriver`](crate::MemoryDriver) keeps collections in memory and
/// records every call it receives.
///
/// ### Method overview
///
/// | Method name                 | Outcome                     | Corresponding `MongoDB` call               |
/// |-----------------------------|-----------------------------|--------------------------------------------|
/// | `Model::find`               | `Outcome::Many`             | `db.users.find(filter, projection)`        |
/// | `Model::find_one`           | `Outcome::One`              | `db.users.findOne(filter, projection)`     |
/// | `Model::count`              | `Outcome::Count`            | `db.users.countDocuments(filter)`          |
/// | `Model::distinct`           | `Outcome::Distinct`         | `db.users.distinct(field, filter)`         |
/// | `Model::delete_one`         | `Outcome::Deleted`          | `db.users.deleteOne(filter)`               |
/// | `Model::delete_many`        | `Outcome::Deleted`          | `db.users.deleteMany(filter)`              |
/// | `Model::update_one`         | `Outcome::Updated`          | `db.users.updateOne(filter, update)`       |
/// | `Model::update_many`        | `Outcome::Updated`          | `db.users.updateMany(filter, update)`      |
/// | `Model::replace_one`        | `Outcome::Updated`          | `db.users.replaceOne(filter, replacement)` |
/// | `Model::find_one_and_update`| `Outcome::One` or `Raw`     | `findAndModify` with `update`              |
/// | `Model::find_one_and_remove`| `Outcome::One` or `Raw`     | `findAndModify` with `remove: true`        |
///
/// Every method only declares the query. Nothing is sent until
/// [`Query::exec`](crate::Query::exec) is awaited.
mod getting_started {}

/// ### Conditions
///
/// Conditions start from the document given to the constructor and grow with
/// every call. A later call overwrites an earlier one at the same key.
///
/// ```rust,ignore
/// let mut query = User::find(&connection, doc! { "name": "kit" });
///
/// // { age: { $gte: 18, $lt: 65 } }
/// query.path("age").gte(18).lt(65);
///
/// // The last path stays in scope for value-only calls
/// query.last(Cmp::Ne, 30)?;
///
/// // Logical operators append clauses
/// query.or([doc! { "role": "admin" }, doc! { "role": "owner" }]);
/// ```
///
/// An operator on a path that already holds a plain value keeps the value as
/// `$eq`: `{ age: 30 }` followed by `.path("age").lte(40)` becomes
/// `{ age: { $eq: 30, $lte: 40 } }`.
///
/// ### Geo conditions
///
/// [`PathScope::near`](crate::PathScope::near) and
/// [`PathScope::within`](crate::PathScope::within) emit GeoJSON operators, or
/// the legacy `$near` pair and `$within` forms when
/// [`Config::legacy_geo`](crate::Config::legacy_geo) is set.
///
/// ### Merging
///
/// [`Query::merge_query`](crate::Query::merge_query) folds another builder into
/// this one, [`Query::merge_conditions`](crate::Query::merge_conditions) folds a
/// filter document. Documents merge recursively and the merged side wins.
///
/// ```rust,ignore
/// let mut query = User::find(&connection, doc! { "age": { "$gte": 1 } });
/// query.merge_conditions(&doc! { "age": { "$gte": 5 } });
///
/// assert_eq!(query.conditions(), &doc! { "age": { "$gte": 5 } });
/// ```
mod conditions {}

/// ### Selecting fields
///
/// [`Query::select`](crate::Query::select) accepts a space separated list or a
/// document. A list entry starting with `-` excludes the path, one starting with
/// `+` includes a path marked `#[model(hidden)]`.
///
/// ```rust,ignore
/// query.select("name age")?;
///
/// // Mixing inclusion and exclusion is an error, except for `_id`
/// assert!(query.select("-password").is_err());
///
/// // Hidden paths are excluded from every read unless forced in
/// query.select("+password")?;
/// ```
///
/// Arrays can be sliced with [`Query::slice`](crate::Query::slice):
///
/// ```rust,ignore
/// query.slice("comments", Slice::Range(10, 5));
/// ```
mod projections {}

/// ### Updates
///
/// Update documents may mix operators with plain paths. Plain paths are folded
/// into `$set`, next to an existing `$set` bucket.
///
/// ```rust,ignore
/// // { $set: { name: "kit", age: 31 }, $inc: { visits: 1 } }
/// let mut query = User::update_one(
///     &connection,
///     doc! { "_id": id },
///     doc! { "name": "kit", "$set": { "age": "31" }, "$inc": { "visits": 1 } },
/// );
/// ```
///
/// With `runValidators` the validators of every written path run before the
/// update is sent. With `upsert` and `setDefaultsOnInsert`, schema defaults for
/// paths that neither the filter nor the update mention are added to `$set`.
///
/// An update that casts to an empty document is never sent. For
/// `find_one_and_update` without `upsert` it becomes a plain `find_one`.
mod updates {}

/// ### Errors
///
/// Programmer errors, such as a value-only call with no path in scope, fail at
/// the call site. Cast and validation errors are recorded on the builder and
/// returned by [`Query::exec`](crate::Query::exec). The pending error can be read
/// with [`Query::error`](crate::Query::error) and cleared with
/// [`Query::set_error`](crate::Query::set_error).
///
/// ```rust,ignore
/// let mut query = User::find(&connection, doc! { "age": "abc" });
///
/// match query.exec().await {
///     Err(Error::Cast(error)) => assert_eq!(error.path, "age"),
///     other => panic!("unexpected {other:?}"),
/// }
/// ```
///
/// Driver errors are passed through as [`Error::Driver`](crate::Error::Driver).
/// Nothing is retried.
mod errors {}

/// ### Lean results and population
///
/// Lean queries deliver [`Record::Lean`](crate::Record::Lean) documents and skip
/// hydration. Population still runs.
///
/// ```rust,ignore
/// #[derive(Deserialize, Model)]
/// struct Post {
///   #[serde(rename = "_id")]
///   id: ObjectId,
///   #[model(reference = "users")]
///   author: Document,
/// }
///
/// let mut query = Post::find(&connection, doc! {});
/// query.populate("author");
/// ```
///
/// ### Templates
///
/// [`Query::to_template`](crate::Query::to_template) captures the current state.
/// Every [`QueryTemplate::query`](crate::QueryTemplate::query) call returns an
/// independent builder.
mod results {}
