//! Driver-facing query options and builder-only options.

use crate::error::{Error, Result};
use crate::populate::PopulateOptions;
use crate::schema::ValidationContext;
use mongodb::bson::{Bson, Document};
use std::{collections::HashMap, time::Duration};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Asc => 1,
            Self::Desc => -1,
        }
    }

    fn parse(value: &Bson) -> Result<Self> {
        let order = match value {
            Bson::Int32(1) | Bson::Int64(1) => Some(Self::Asc),
            Bson::Int32(-1) | Bson::Int64(-1) => Some(Self::Desc),
            #[allow(clippy::float_cmp)]
            Bson::Double(n) if *n == 1.0 => Some(Self::Asc),
            #[allow(clippy::float_cmp)]
            Bson::Double(n) if *n == -1.0 => Some(Self::Desc),
            Bson::String(s) => match s.to_ascii_lowercase().as_str() {
                "asc" | "ascending" => Some(Self::Asc),
                "desc" | "descending" => Some(Self::Desc),
                _ => None,
            },
            _ => None,
        };

        order.ok_or_else(|| {
            Error::shape(
                "sort",
                "Query::sort",
                format!("has invalid direction {value}, expected 1, -1, \"asc\" or \"desc\""),
            )
        })
    }
}

/// A sort specification in any of the accepted input shapes.
#[derive(Clone, Debug, PartialEq)]
pub enum SortSpec {
    /// `"name -age"`: whitespace separated paths, `-` for descending.
    List(String),
    Mapping(Document),
    Pairs(Vec<(String, SortOrder)>),
}

impl SortSpec {
    /// Normalizes into ordered `(path, order)` pairs.
    pub fn into_pairs(self) -> Result<Vec<(String, SortOrder)>> {
        match self {
            Self::List(list) => Ok(list
                .split_whitespace()
                .map(|token| match token.strip_prefix('-') {
                    Some(path) => (path.to_owned(), SortOrder::Desc),
                    None => (token.to_owned(), SortOrder::Asc),
                })
                .collect()),
            Self::Mapping(mapping) => mapping
                .iter()
                .map(|(path, order)| Ok((path.clone(), SortOrder::parse(order)?)))
                .collect(),
            Self::Pairs(pairs) => Ok(pairs),
        }
    }

    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::String(list) => Ok(Self::List(list.clone())),
            Bson::Document(mapping) => Ok(Self::Mapping(mapping.clone())),
            other => Err(Error::shape(
                "sort",
                "Query::set_options",
                format!("must be a string or a document, got {other}"),
            )),
        }
    }
}

impl From<&str> for SortSpec {
    fn from(value: &str) -> Self {
        Self::List(value.to_owned())
    }
}

impl From<Document> for SortSpec {
    fn from(value: Document) -> Self {
        Self::Mapping(value)
    }
}

impl From<Vec<(String, SortOrder)>> for SortSpec {
    fn from(value: Vec<(String, SortOrder)>) -> Self {
        Self::Pairs(value)
    }
}

pub(crate) fn sort_document(pairs: &[(String, SortOrder)]) -> Document {
    pairs
        .iter()
        .map(|(path, order)| (path.clone(), Bson::Int32(order.as_i32())))
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadPreference {
    pub mode: ReadMode,
    pub tag_sets: Vec<HashMap<String, String>>,
}

impl ReadPreference {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            tag_sets: Vec::new(),
        }
    }

    /// Parses a mode name or its short alias (`p`, `pp`, `s`, `sp`, `n`).
    pub fn parse(mode: &str, tag_sets: Vec<HashMap<String, String>>) -> Result<Self> {
        let mode = match mode {
            "primary" | "p" => ReadMode::Primary,
            "primaryPreferred" | "pp" => ReadMode::PrimaryPreferred,
            "secondary" | "s" => ReadMode::Secondary,
            "secondaryPreferred" | "sp" => ReadMode::SecondaryPreferred,
            "nearest" | "n" => ReadMode::Nearest,
            other => {
                return Err(Error::shape(
                    "mode",
                    "Query::read",
                    format!("has unknown read preference `{other}`"),
                ));
            }
        };

        Ok(Self { mode, tag_sets })
    }

    fn from_bson(value: &Bson) -> Result<Self> {
        match value {
            Bson::String(mode) => Self::parse(mode, Vec::new()),
            Bson::Document(document) => {
                let Some(Bson::String(mode)) = document.get("mode") else {
                    return Err(Error::shape(
                        "readPreference",
                        "Query::set_options",
                        "must have a string `mode`",
                    ));
                };

                let tag_sets = match document.get("tags") {
                    Some(Bson::Array(tags)) => tags
                        .iter()
                        .filter_map(Bson::as_document)
                        .map(|tags| {
                            tags.iter()
                                .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_owned())))
                                .collect()
                        })
                        .collect(),
                    _ => Vec::new(),
                };

                Self::parse(mode, tag_sets)
            }
            other => Err(Error::shape(
                "readPreference",
                "Query::set_options",
                format!("must be a string or a document, got {other}"),
            )),
        }
    }
}

/// Options forwarded, after translation, to the driver.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub limit: Option<i64>,
    pub skip: Option<u64>,
    pub sort: Option<Vec<(String, SortOrder)>>,
    pub collation: Option<Document>,
    pub read_preference: Option<ReadPreference>,
    pub upsert: Option<bool>,
    pub multi: Option<bool>,
    pub single: Option<bool>,
    pub overwrite: Option<bool>,
    pub run_validators: Option<bool>,
    pub set_defaults_on_insert: Option<bool>,
    pub raw_result: Option<bool>,
    pub new: Option<bool>,
    pub strict: Option<bool>,
    pub strict_query: Option<bool>,
    pub context: Option<ValidationContext>,
    pub max_time: Option<Duration>,
    pub comment: Option<Bson>,
    pub batch_size: Option<u32>,
    pub array_filters: Option<Vec<Document>>,
    /// Unrecognized keys, passed to the driver untouched.
    pub extra: Document,
}

impl QueryOptions {
    /// Overlays every option set on `other`.
    pub(crate) fn merge(&mut self, other: &QueryOptions) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(
                    if other.$field.is_some() {
                        self.$field.clone_from(&other.$field);
                    }
                )*
            };
        }

        overlay!(
            limit,
            skip,
            sort,
            collation,
            read_preference,
            upsert,
            multi,
            single,
            overwrite,
            run_validators,
            set_defaults_on_insert,
            raw_result,
            new,
            strict,
            strict_query,
            context,
            max_time,
            comment,
            batch_size,
            array_filters
        );

        for (key, value) in &other.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Options that shape local behavior and never reach the driver.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BuilderOptions {
    pub lean: Option<bool>,
    pub populate: Vec<PopulateOptions>,
    pub strict: Option<bool>,
    pub omit_undefined: Option<bool>,
    pub use_find_and_modify: Option<bool>,
    pub or_fail: Option<bool>,
}

impl BuilderOptions {
    pub(crate) fn merge(&mut self, other: &BuilderOptions) {
        if other.lean.is_some() {
            self.lean = other.lean;
        }
        if other.strict.is_some() {
            self.strict = other.strict;
        }
        if other.omit_undefined.is_some() {
            self.omit_undefined = other.omit_undefined;
        }
        if other.use_find_and_modify.is_some() {
            self.use_find_and_modify = other.use_find_and_modify;
        }
        if other.or_fail.is_some() {
            self.or_fail = other.or_fail;
        }
        for directive in &other.populate {
            self.add_populate(directive.clone());
        }
    }

    /// Adds a directive, replacing any earlier directive for the same path.
    pub(crate) fn add_populate(&mut self, directive: PopulateOptions) {
        match self
            .populate
            .iter_mut()
            .find(|existing| existing.path == directive.path)
        {
            Some(existing) => *existing = directive,
            None => self.populate.push(directive),
        }
    }
}

/// Result of splitting a caller-supplied options document.
#[derive(Debug, Default)]
pub(crate) struct ParsedOptions {
    pub options: QueryOptions,
    pub builder: BuilderOptions,
    pub projection: Option<Document>,
}

const CONTEXT: &str = "Query::set_options";

pub(crate) fn parse(document: &Document) -> Result<ParsedOptions> {
    let mut parsed = ParsedOptions::default();
    let options = &mut parsed.options;
    let builder = &mut parsed.builder;

    for (key, value) in document {
        match key.as_str() {
            "limit" => options.limit = Some(int(key, value)?),
            "skip" => options.skip = Some(unsigned(key, value)?),
            "sort" => options.sort = Some(SortSpec::from_bson(value)?.into_pairs()?),
            "collation" => options.collation = Some(document_value(key, value)?),
            "readPreference" | "read" => {
                options.read_preference = Some(ReadPreference::from_bson(value)?);
            }
            "upsert" => options.upsert = Some(flag(key, value)?),
            "multi" => options.multi = Some(flag(key, value)?),
            "single" => options.single = Some(flag(key, value)?),
            "overwrite" => options.overwrite = Some(flag(key, value)?),
            "runValidators" => options.run_validators = Some(flag(key, value)?),
            "setDefaultsOnInsert" => options.set_defaults_on_insert = Some(flag(key, value)?),
            "rawResult" => options.raw_result = Some(flag(key, value)?),
            "new" | "returnOriginal" => {
                let flag = flag(key, value)?;
                options.new = Some(if key == "new" { flag } else { !flag });
            }
            "strict" => {
                let flag = flag(key, value)?;
                options.strict = Some(flag);
                builder.strict = Some(flag);
            }
            "strictQuery" => options.strict_query = Some(flag(key, value)?),
            "context" => {
                options.context = Some(match value.as_str() {
                    Some("query") => ValidationContext::Query,
                    Some("document") => ValidationContext::Document,
                    _ => {
                        return Err(Error::shape(
                            "context",
                            CONTEXT,
                            format!("must be \"query\" or \"document\", got {value}"),
                        ));
                    }
                });
            }
            "maxTimeMS" => options.max_time = Some(Duration::from_millis(unsigned(key, value)?)),
            "comment" => options.comment = Some(value.clone()),
            "batchSize" => {
                let size = unsigned(key, value)?;
                options.batch_size = Some(u32::try_from(size).map_err(|_| {
                    Error::shape("batchSize", CONTEXT, "is out of range")
                })?);
            }
            "arrayFilters" => {
                let Bson::Array(filters) = value else {
                    return Err(Error::shape("arrayFilters", CONTEXT, "must be an array"));
                };
                options.array_filters = Some(
                    filters
                        .iter()
                        .map(|filter| document_value(key, filter))
                        .collect::<Result<_>>()?,
                );
            }
            "lean" => builder.lean = Some(flag(key, value)?),
            "omitUndefined" => builder.omit_undefined = Some(flag(key, value)?),
            "useFindAndModify" => builder.use_find_and_modify = Some(flag(key, value)?),
            "orFail" => builder.or_fail = Some(flag(key, value)?),
            "populate" => {
                for directive in PopulateOptions::from_bson(value)? {
                    builder.add_populate(directive);
                }
            }
            "fields" | "projection" => parsed.projection = Some(document_value(key, value)?),
            _ => {
                options.extra.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(parsed)
}

fn flag(key: &str, value: &Bson) -> Result<bool> {
    match value {
        Bson::Boolean(b) => Ok(*b),
        Bson::Int32(n) => Ok(*n != 0),
        Bson::Int64(n) => Ok(*n != 0),
        other => Err(Error::shape(
            static_key(key),
            CONTEXT,
            format!("must be a boolean, got {other}"),
        )),
    }
}

fn int(key: &str, value: &Bson) -> Result<i64> {
    match value {
        Bson::Int32(n) => Ok(i64::from(*n)),
        Bson::Int64(n) => Ok(*n),
        #[allow(clippy::cast_possible_truncation)]
        Bson::Double(n) if n.fract() == 0.0 => Ok(*n as i64),
        other => Err(Error::shape(
            static_key(key),
            CONTEXT,
            format!("must be an integer, got {other}"),
        )),
    }
}

fn unsigned(key: &str, value: &Bson) -> Result<u64> {
    u64::try_from(int(key, value)?)
        .map_err(|_| Error::shape(static_key(key), CONTEXT, "must not be negative"))
}

fn document_value(key: &str, value: &Bson) -> Result<Document> {
    match value {
        Bson::Document(document) => Ok(document.clone()),
        other => Err(Error::shape(
            static_key(key),
            CONTEXT,
            format!("must be a document, got {other}"),
        )),
    }
}

/// Error parameters are static; map the recognized keys back onto literals.
fn static_key(key: &str) -> &'static str {
    const KEYS: &[&str] = &[
        "limit",
        "skip",
        "collation",
        "upsert",
        "multi",
        "single",
        "overwrite",
        "runValidators",
        "setDefaultsOnInsert",
        "rawResult",
        "new",
        "returnOriginal",
        "strict",
        "strictQuery",
        "maxTimeMS",
        "batchSize",
        "arrayFilters",
        "lean",
        "omitUndefined",
        "useFindAndModify",
        "orFail",
        "fields",
        "projection",
    ];

    KEYS.iter().find(|k| **k == key).copied().unwrap_or("options")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::doc;

    #[test]
    fn splits_builder_options_from_driver_options() {
        let parsed = parse(&doc! {
            "limit": 10,
            "lean": true,
            "omitUndefined": true,
            "useFindAndModify": false,
            "populate": "author",
            "maxTimeMS": 250,
            "allowDiskUse": true,
        })
        .unwrap();

        assert_eq!(parsed.options.limit, Some(10));
        assert_eq!(parsed.options.max_time, Some(Duration::from_millis(250)));
        assert_eq!(parsed.options.extra, doc! { "allowDiskUse": true });
        assert_eq!(parsed.builder.lean, Some(true));
        assert_eq!(parsed.builder.omit_undefined, Some(true));
        assert_eq!(parsed.builder.use_find_and_modify, Some(false));
        assert_eq!(parsed.builder.populate[0].path, "author");
    }

    #[test]
    fn rejects_wrongly_typed_flags() {
        let error = parse(&doc! { "upsert": "yes" }).unwrap_err();

        assert!(matches!(
            error,
            Error::ParameterShape {
                parameter: "upsert",
                ..
            }
        ));
    }

    #[test]
    fn sort_mapping_becomes_ordered_pairs() {
        let pairs = SortSpec::from(doc! { "b": -1, "a": "asc" }).into_pairs().unwrap();

        assert_eq!(
            pairs,
            vec![("b".to_owned(), SortOrder::Desc), ("a".to_owned(), SortOrder::Asc)]
        );
    }

    #[test]
    fn sort_spec_string() {
        let pairs = SortSpec::from("name -age").into_pairs().unwrap();

        assert_eq!(sort_document(&pairs), doc! { "name": 1, "age": -1 });
    }

    #[test]
    fn read_preference_aliases() {
        assert_eq!(
            ReadPreference::parse("sp", Vec::new()).unwrap().mode,
            ReadMode::SecondaryPreferred
        );
        assert!(ReadPreference::parse("fastest", Vec::new()).is_err());
    }
}
