//! The schema descriptor consumed by the cast pipeline.
//!
//! A [`Schema`] maps dotted paths to a [`FieldType`] plus per-path options
//! (default value, validators, visibility, reference target). It is usually
//! generated by `#[derive(Model)]`, but can be assembled by hand:
//!
//! ```rust
//! use quarry::schema::{FieldType, Schema, SchemaPath};
//!
//! let schema = Schema::new("User")
//!     .path("name", FieldType::String)
//!     .with_path("age", SchemaPath::new(FieldType::Number).min(0.0))
//!     .with_path("password", SchemaPath::new(FieldType::String).hidden());
//!
//! assert!(schema.resolve_type("age").is_some());
//! ```

use crate::error::{CastError, ValidationError, ValidatorError};
use crate::path;
use mongodb::bson::{self, Bson, Document, oid::ObjectId};
use std::{collections::BTreeMap, fmt, sync::Arc};

#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    ObjectId,
    Date,
    Array(Box<FieldType>),
    Mixed,
}

impl FieldType {
    pub fn array(of: FieldType) -> Self {
        Self::Array(Box::new(of))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Number => "Number",
            Self::Boolean => "Boolean",
            Self::ObjectId => "ObjectId",
            Self::Date => "Date",
            Self::Array(_) => "Array",
            Self::Mixed => "Mixed",
        }
    }

    /// Element type for arrays, the type itself otherwise.
    pub fn element(&self) -> &FieldType {
        match self {
            Self::Array(inner) => inner.as_ref(),
            other => other,
        }
    }

    /// Converts `raw` to the storage representation of this type.
    ///
    /// `null` and `undefined` are accepted by every type.
    pub fn cast(&self, raw: &Bson) -> std::result::Result<Bson, ()> {
        if matches!(raw, Bson::Null | Bson::Undefined) {
            return Ok(raw.clone());
        }

        match self {
            Self::Mixed => Ok(raw.clone()),
            Self::String => cast_string(raw),
            Self::Number => cast_number(raw),
            Self::Boolean => cast_boolean(raw),
            Self::ObjectId => cast_object_id(raw),
            Self::Date => cast_date(raw),
            Self::Array(inner) => match raw {
                Bson::Array(items) => items
                    .iter()
                    .map(|item| inner.cast(item))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map(Bson::Array),
                single => Ok(Bson::Array(vec![inner.cast(single)?])),
            },
        }
    }
}

fn cast_string(raw: &Bson) -> std::result::Result<Bson, ()> {
    match raw {
        Bson::String(_) => Ok(raw.clone()),
        Bson::Int32(n) => Ok(Bson::String(n.to_string())),
        Bson::Int64(n) => Ok(Bson::String(n.to_string())),
        Bson::Double(n) => Ok(Bson::String(n.to_string())),
        Bson::Boolean(b) => Ok(Bson::String(b.to_string())),
        Bson::ObjectId(oid) => Ok(Bson::String(oid.to_hex())),
        _ => Err(()),
    }
}

fn cast_number(raw: &Bson) -> std::result::Result<Bson, ()> {
    match raw {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Ok(raw.clone()),
        Bson::Boolean(b) => Ok(Bson::Int32(i32::from(*b))),
        Bson::String(s) => {
            let s = s.trim();

            if s.is_empty() {
                return Ok(Bson::Null);
            }

            if let Ok(n) = s.parse::<i64>() {
                return Ok(i32::try_from(n).map_or(Bson::Int64(n), Bson::Int32));
            }

            match s.parse::<f64>() {
                Ok(n) if n.is_finite() => Ok(Bson::Double(n)),
                _ => Err(()),
            }
        }
        _ => Err(()),
    }
}

fn cast_boolean(raw: &Bson) -> std::result::Result<Bson, ()> {
    match raw {
        Bson::Boolean(_) => Ok(raw.clone()),
        Bson::Int32(1) | Bson::Int64(1) => Ok(Bson::Boolean(true)),
        Bson::Int32(0) | Bson::Int64(0) => Ok(Bson::Boolean(false)),
        Bson::String(s) => match s.as_str() {
            "true" | "1" | "yes" => Ok(Bson::Boolean(true)),
            "false" | "0" | "no" => Ok(Bson::Boolean(false)),
            _ => Err(()),
        },
        _ => Err(()),
    }
}

fn cast_object_id(raw: &Bson) -> std::result::Result<Bson, ()> {
    match raw {
        Bson::ObjectId(_) => Ok(raw.clone()),
        Bson::String(s) => ObjectId::parse_str(s).map(Bson::ObjectId).map_err(|_| ()),
        // A populated document stands in for its id.
        Bson::Document(document) => match document.get("_id") {
            Some(Bson::ObjectId(oid)) => Ok(Bson::ObjectId(*oid)),
            _ => Err(()),
        },
        _ => Err(()),
    }
}

fn cast_date(raw: &Bson) -> std::result::Result<Bson, ()> {
    match raw {
        Bson::DateTime(_) => Ok(raw.clone()),
        Bson::Int64(ms) => Ok(Bson::DateTime(bson::DateTime::from_millis(*ms))),
        Bson::Int32(ms) => Ok(Bson::DateTime(bson::DateTime::from_millis(i64::from(*ms)))),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(ms) if ms.is_finite() => {
            Ok(Bson::DateTime(bson::DateTime::from_millis(*ms as i64)))
        }
        Bson::String(s) => {
            if let Ok(ms) = s.parse::<i64>() {
                return Ok(Bson::DateTime(bson::DateTime::from_millis(ms)));
            }

            chrono::DateTime::parse_from_rfc3339(s)
                .map(|date| Bson::DateTime(bson::DateTime::from_millis(date.timestamp_millis())))
                .map_err(|_| ())
        }
        _ => Err(()),
    }
}

/// Whether a validator runs against a whole document or against an update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ValidationContext {
    #[default]
    Document,
    Query,
}

pub type ValidatorFn = Arc<dyn Fn(&Bson, ValidationContext) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Validator {
    Required,
    Min(f64),
    Max(f64),
    Enum(Vec<Bson>),
    Custom {
        name: String,
        message: String,
        check: ValidatorFn,
    },
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => f.write_str("Required"),
            Self::Min(min) => f.debug_tuple("Min").field(min).finish(),
            Self::Max(max) => f.debug_tuple("Max").field(max).finish(),
            Self::Enum(values) => f.debug_tuple("Enum").field(values).finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl Validator {
    pub fn custom(
        name: impl Into<String>,
        message: impl Into<String>,
        check: impl Fn(&Bson, ValidationContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom {
            name: name.into(),
            message: message.into(),
            check: Arc::new(check),
        }
    }

    fn check(&self, path: &str, value: &Bson, context: ValidationContext) -> Option<ValidatorError> {
        let missing = matches!(value, Bson::Null | Bson::Undefined);

        let (kind, message) = match self {
            Self::Required if missing => ("required", format!("Path `{path}` is required.")),
            Self::Min(min) if !missing && as_f64(value).is_some_and(|n| n < *min) => (
                "min",
                format!("Path `{path}` ({value}) is less than minimum allowed value ({min})."),
            ),
            Self::Max(max) if !missing && as_f64(value).is_some_and(|n| n > *max) => (
                "max",
                format!("Path `{path}` ({value}) is more than maximum allowed value ({max})."),
            ),
            Self::Enum(values) if !missing && !values.contains(value) => (
                "enum",
                format!("`{value}` is not a valid enum value for path `{path}`."),
            ),
            Self::Custom {
                name,
                message,
                check,
            } if !missing && !check(value, context) => {
                return Some(ValidatorError {
                    kind: name.clone(),
                    path: path.to_owned(),
                    value: value.clone(),
                    message: message.clone(),
                    cause: None,
                });
            }
            _ => return None,
        };

        Some(ValidatorError {
            kind: kind.to_owned(),
            path: path.to_owned(),
            value: value.clone(),
            message,
            cause: None,
        })
    }
}

pub(crate) fn as_f64(value: &Bson) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

#[derive(Clone, Debug)]
pub struct SchemaPath {
    ty: FieldType,
    default: Option<Bson>,
    validators: Vec<Validator>,
    selected: bool,
    reference: Option<String>,
}

impl SchemaPath {
    pub fn new(ty: FieldType) -> Self {
        Self {
            ty,
            default: None,
            validators: Vec::new(),
            selected: true,
            reference: None,
        }
    }

    pub fn required(self) -> Self {
        self.validate(Validator::Required)
    }

    pub fn min(self, min: f64) -> Self {
        self.validate(Validator::Min(min))
    }

    pub fn max(self, max: f64) -> Self {
        self.validate(Validator::Max(max))
    }

    pub fn one_of(self, values: impl IntoIterator<Item = impl Into<Bson>>) -> Self {
        self.validate(Validator::Enum(values.into_iter().map(Into::into).collect()))
    }

    pub fn validate(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn default_value(mut self, value: impl Into<Bson>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Excludes the path from query results unless explicitly selected with `+path`.
    pub fn hidden(mut self) -> Self {
        self.selected = false;
        self
    }

    /// Collection holding the documents this path references by `_id`.
    pub fn reference(mut self, collection: impl Into<String>) -> Self {
        self.reference = Some(collection.into());
        self
    }

    pub fn ty(&self) -> &FieldType {
        &self.ty
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Discriminator {
    pub key: String,
    pub value: Bson,
}

#[derive(Clone, Debug)]
pub struct Schema {
    name: &'static str,
    paths: BTreeMap<String, SchemaPath>,
    discriminator: Option<Discriminator>,
    collation: Option<Document>,
    strict: bool,
    strict_query: Option<bool>,
}

impl Schema {
    /// An empty schema. `_id` is declared `Mixed` until a path overrides it.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            paths: BTreeMap::from([("_id".to_owned(), SchemaPath::new(FieldType::Mixed))]),
            discriminator: None,
            collation: None,
            strict: true,
            strict_query: None,
        }
    }

    pub fn path(self, path: impl Into<String>, ty: FieldType) -> Self {
        self.with_path(path, SchemaPath::new(ty))
    }

    pub fn with_path(mut self, path: impl Into<String>, options: SchemaPath) -> Self {
        self.paths.insert(path.into(), options);
        self
    }

    /// Marks this schema as a non-root discriminated type stored alongside its siblings.
    pub fn discriminator(mut self, key: impl Into<String>, value: impl Into<Bson>) -> Self {
        let key = key.into();
        self.paths
            .entry(key.clone())
            .or_insert_with(|| SchemaPath::new(FieldType::String));
        self.discriminator = Some(Discriminator {
            key,
            value: value.into(),
        });
        self
    }

    pub fn with_collation(mut self, collation: Document) -> Self {
        self.collation = Some(collation);
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_strict_query(mut self, strict_query: bool) -> Self {
        self.strict_query = Some(strict_query);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn strict_query(&self) -> Option<bool> {
        self.strict_query
    }

    pub fn collation(&self) -> Option<&Document> {
        self.collation.as_ref()
    }

    pub fn discriminator_mapping(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }

    pub fn is_discriminated_non_root(&self) -> bool {
        self.discriminator.is_some()
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, &SchemaPath)> {
        self.paths.iter().map(|(path, options)| (path.as_str(), options))
    }

    pub fn schema_path(&self, path: &str) -> Option<&SchemaPath> {
        self.paths.get(path)
    }

    /// Resolves the declared type at `path`.
    ///
    /// Numeric and positional segments following an array path resolve to the
    /// array's element type. Paths below a `Mixed` path resolve to `Mixed`.
    pub fn resolve_type(&self, path: &str) -> Option<&FieldType> {
        if let Some(options) = self.paths.get(path) {
            return Some(&options.ty);
        }

        let segments: Vec<&str> = path.split('.').collect();

        let mut declared = String::new();
        let mut resolved: Option<&FieldType> = None;

        for segment in segments {
            if let Some(ty) = resolved {
                match ty {
                    FieldType::Mixed => return Some(ty),
                    FieldType::Array(inner) if path::is_element_segment(segment) => {
                        resolved = Some(inner.as_ref());
                        continue;
                    }
                    _ => {}
                }
            }

            if path::is_element_segment(segment) {
                continue;
            }

            if !declared.is_empty() {
                declared.push('.');
            }
            declared.push_str(segment);

            resolved = self.paths.get(&declared).map(|options| &options.ty);
        }

        resolved
    }

    /// True when some declared path lives below `prefix`.
    pub fn has_children(&self, prefix: &str) -> bool {
        self.paths.keys().any(|declared| {
            declared
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    pub fn default_value_for(&self, path: &str) -> Option<&Bson> {
        self.paths.get(path).and_then(|options| options.default.as_ref())
    }

    pub fn reference_for(&self, path: &str) -> Option<&str> {
        self.paths
            .get(path)
            .and_then(|options| options.reference.as_deref())
    }

    pub fn hidden_paths(&self) -> impl Iterator<Item = &str> {
        self.paths
            .iter()
            .filter(|(_, options)| !options.selected)
            .map(|(path, _)| path.as_str())
    }

    pub fn run_field_validators(
        &self,
        path: &str,
        value: &Bson,
        context: ValidationContext,
    ) -> Vec<ValidatorError> {
        let Some(options) = self.paths.get(path) else {
            return Vec::new();
        };

        options
            .validators
            .iter()
            .filter_map(|validator| validator.check(path, value, context))
            .collect()
    }

    /// Runs every validator of every declared path against a whole document.
    pub fn validate_document(&self, document: &Document) -> Result<(), ValidationError> {
        let errors: Vec<ValidatorError> = self
            .paths
            .keys()
            .flat_map(|declared| {
                let value = path::get(document, declared).unwrap_or(&Bson::Null);
                self.run_field_validators(declared, value, ValidationContext::Document)
            })
            .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                model: self.name,
                errors,
            })
        }
    }

    pub(crate) fn cast_error(&self, path: &str, value: &Bson, ty: &FieldType) -> CastError {
        CastError {
            path: path.to_owned(),
            value: value.clone(),
            kind: ty.name(),
            model: self.name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    fn schema() -> Schema {
        Schema::new("Post")
            .path("title", FieldType::String)
            .path("tags", FieldType::array(FieldType::String))
            .path("meta", FieldType::Mixed)
            .with_path("score", SchemaPath::new(FieldType::Number).min(0.0).max(10.0))
    }

    #[test]
    fn resolves_array_elements_and_mixed_children() {
        let schema = schema();

        assert_eq!(schema.resolve_type("tags.0"), Some(&FieldType::String));
        assert_eq!(schema.resolve_type("tags.$"), Some(&FieldType::String));
        assert_eq!(schema.resolve_type("meta.anything.deep"), Some(&FieldType::Mixed));
        assert_eq!(schema.resolve_type("missing"), None);
    }

    #[test]
    fn number_cast_prefers_integers() {
        assert_eq!(FieldType::Number.cast(&Bson::from("21")), Ok(Bson::Int32(21)));
        assert_eq!(FieldType::Number.cast(&Bson::from("2.5")), Ok(Bson::Double(2.5)));
        assert_eq!(FieldType::Number.cast(&Bson::from("abc")), Err(()));
    }

    #[test]
    fn date_cast_accepts_rfc3339() {
        let cast = FieldType::Date.cast(&Bson::from("1970-01-01T00:00:01Z"));
        assert_eq!(cast, Ok(Bson::DateTime(bson::DateTime::from_millis(1000))));
    }

    #[test]
    fn validate_document_collects_all_failures() {
        let schema = schema().with_path("author", SchemaPath::new(FieldType::String).required());

        let error = schema
            .validate_document(&doc! { "score": 11 })
            .unwrap_err();

        assert_eq!(error.errors.len(), 2);
        assert_eq!(error.path("author").unwrap().kind, "required");
        assert_eq!(error.path("score").unwrap().kind, "max");
    }
}
