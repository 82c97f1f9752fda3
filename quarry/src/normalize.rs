//! Pure transforms from builder call shapes to the canonical filter,
//! projection and update documents.

use crate::{
    Error, Result, path,
    schema::{Discriminator, Schema},
};
use mongodb::bson::{Bson, Document, doc};

/// Comparison and element operators accepted by path-scoped calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    All,
    Size,
    Exists,
    Regex,
    Options,
    ElemMatch,
    Mod,
    Not,
    MaxDistance,
    MinDistance,
}

impl Cmp {
    pub fn sigil(self) -> &'static str {
        match self {
            Self::Eq => "$eq",
            Self::Ne => "$ne",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::In => "$in",
            Self::Nin => "$nin",
            Self::All => "$all",
            Self::Size => "$size",
            Self::Exists => "$exists",
            Self::Regex => "$regex",
            Self::Options => "$options",
            Self::ElemMatch => "$elemMatch",
            Self::Mod => "$mod",
            Self::Not => "$not",
            Self::MaxDistance => "$maxDistance",
            Self::MinDistance => "$minDistance",
        }
    }
}

/// Writes `conditions[path][operator] = value`.
///
/// An existing equality at `path` is kept as `$eq` next to the new operator.
pub(crate) fn apply_operator(conditions: &mut Document, path: &str, operator: &str, value: Bson) {
    let entry = conditions
        .entry(path.to_owned())
        .or_insert_with(|| Bson::Document(Document::new()));

    match entry {
        Bson::Document(existing) if existing.is_empty() || path::has_operators(existing) => {
            existing.insert(operator, value);
        }
        equality => {
            let previous = std::mem::replace(equality, Bson::Null);
            *equality = Bson::Document(doc! { "$eq": previous, operator: value });
        }
    }
}

/// A field selection in either accepted shape.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// `"name -password +secret"`.
    List(String),
    Mapping(Document),
}

impl From<&str> for Selection {
    fn from(list: &str) -> Self {
        Self::List(list.to_owned())
    }
}

impl From<String> for Selection {
    fn from(list: String) -> Self {
        Self::List(list)
    }
}

impl From<Document> for Selection {
    fn from(mapping: Document) -> Self {
        Self::Mapping(mapping)
    }
}

fn marker(value: &Bson) -> Option<bool> {
    match value {
        Bson::Boolean(flag) => Some(*flag),
        Bson::Int32(n) => Some(*n != 0),
        Bson::Int64(n) => Some(*n != 0),
        Bson::Double(n) => Some(*n != 0.0),
        _ => None,
    }
}

/// True when the projection lists paths to return rather than paths to drop.
pub(crate) fn is_inclusive(fields: &Document) -> bool {
    fields
        .iter()
        .any(|(key, value)| key != "_id" && marker(value) == Some(true))
}

/// Rejects projections mixing inclusion and exclusion outside of `_id`.
pub(crate) fn check_polarity(fields: &Document) -> Result<()> {
    let mut first: Option<(&str, bool)> = None;

    for (key, value) in fields {
        if key == "_id" {
            continue;
        }
        let Some(include) = marker(value) else {
            continue;
        };

        match first {
            None => first = Some((key.as_str(), include)),
            Some((other, polarity)) if polarity != include => {
                let (included, excluded) = if include {
                    (key.as_str(), other)
                } else {
                    (other, key.as_str())
                };
                return Err(Error::shape(
                    "fields",
                    "Query::select",
                    format!("cannot mix inclusion of `{included}` with exclusion of `{excluded}`"),
                ));
            }
            Some(_) => {}
        }
    }

    Ok(())
}

/// Merges `selection` into `fields`; `+path` tokens land in `forced`.
///
/// Nothing is changed when the merged projection would mix polarities.
pub(crate) fn select(
    fields: &mut Option<Document>,
    forced: &mut Vec<String>,
    selection: Selection,
) -> Result<()> {
    let mut merged = fields.clone().unwrap_or_default();
    let mut forced_now = Vec::new();

    match selection {
        Selection::List(list) => {
            for token in list.split_whitespace() {
                let (key, value) = match token.as_bytes()[0] {
                    b'-' => (&token[1..], Some(0)),
                    b'+' => (&token[1..], None),
                    _ => (token, Some(1)),
                };

                if key.is_empty() {
                    return Err(Error::shape(
                        "fields",
                        "Query::select",
                        format!("has an empty path in `{list}`"),
                    ));
                }

                match value {
                    Some(value) => {
                        merged.insert(key, value);
                    }
                    None => {
                        if merged.get(key).and_then(marker) == Some(false) {
                            merged.remove(key);
                        }
                        forced_now.push(key.to_owned());
                    }
                }
            }
        }
        Selection::Mapping(mapping) => {
            for (key, value) in mapping {
                match value {
                    Bson::Boolean(_)
                    | Bson::Int32(_)
                    | Bson::Int64(_)
                    | Bson::Double(_)
                    | Bson::Document(_) => {
                        merged.insert(key, value);
                    }
                    other => {
                        return Err(Error::shape(
                            "fields",
                            "Query::select",
                            format!("value for `{key}` must be a number, a boolean or a document, got {other}"),
                        ));
                    }
                }
            }
        }
    }

    check_polarity(&merged)?;

    *fields = Some(merged);
    for key in forced_now {
        if !forced.contains(&key) {
            forced.push(key);
        }
    }

    Ok(())
}

/// Projection sent to the driver: the caller's projection plus exclusions
/// for schema-hidden paths that were neither forced nor explicitly listed.
pub(crate) fn effective_projection(
    schema: &Schema,
    fields: Option<&Document>,
    forced: &[String],
) -> Option<Document> {
    let mut projection = fields.cloned().unwrap_or_default();

    if is_inclusive(&projection) {
        for key in forced {
            projection.insert(key.clone(), 1);
        }
    } else {
        for hidden in schema.hidden_paths() {
            let is_forced = forced.iter().any(|key| path::overlaps(key, hidden));
            let listed = projection.keys().any(|key| path::overlaps(key, hidden));
            if !is_forced && !listed {
                projection.insert(hidden, 0);
            }
        }
    }

    (!projection.is_empty()).then_some(projection)
}

/// A `$slice` projection directive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slice {
    /// First `n` elements, or last `-n` when negative.
    Limit(i64),
    /// `[skip, limit]`.
    Range(i64, i64),
}

impl Slice {
    pub(crate) fn directive(self) -> Document {
        match self {
            Self::Limit(n) => doc! { "$slice": n },
            Self::Range(skip, limit) => doc! { "$slice": [skip, limit] },
        }
    }

    /// Parses `n` or `[skip, limit]`.
    pub(crate) fn from_bson(value: &Bson) -> Result<Self> {
        let int = |value: &Bson| match value {
            Bson::Int32(n) => Some(i64::from(*n)),
            Bson::Int64(n) => Some(*n),
            _ => None,
        };

        match value {
            Bson::Array(pair) if pair.len() == 2 => match (int(&pair[0]), int(&pair[1])) {
                (Some(skip), Some(limit)) => Ok(Self::Range(skip, limit)),
                _ => Err(Error::shape("slice", "Query::slice", "range must hold two integers")),
            },
            other => int(other).map(Self::Limit).ok_or_else(|| {
                Error::shape(
                    "slice",
                    "Query::slice",
                    format!("must be an integer or a [skip, limit] pair, got {other}"),
                )
            }),
        }
    }
}

/// Recursively merges `source` into `target`; `source` wins on conflicts.
pub(crate) fn deep_merge(target: &mut Document, source: &Document) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Bson::Document(existing)), Bson::Document(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Scopes `conditions` to the discriminated type.
///
/// A different caller-supplied value for the key moves into an `$and` clause
/// so it still constrains the result without replacing the scoping pair.
pub(crate) fn inject_discriminator(conditions: &mut Document, discriminator: &Discriminator) {
    let key = discriminator.key.as_str();

    match conditions.get(key) {
        Some(existing) if *existing == discriminator.value => return,
        Some(_) => {
            if let Some(caller) = conditions.remove(key) {
                let clause = Bson::Document(doc! { key: caller });
                match conditions.get_mut("$and") {
                    Some(Bson::Array(clauses)) => clauses.push(clause),
                    _ => {
                        conditions.insert("$and", vec![clause]);
                    }
                }
            }
        }
        None => {}
    }

    conditions.insert(key, discriminator.value.clone());
}

/// A `[longitude, latitude]` coordinate pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub lng: f64,
    pub lat: f64,
}

impl Point {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    fn pair(self) -> Bson {
        Bson::Array(vec![Bson::Double(self.lng), Bson::Double(self.lat)])
    }

    fn geometry(self) -> Document {
        doc! { "type": "Point", "coordinates": self.pair() }
    }
}

/// Region accepted by `within`.
#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Box { bottom_left: Point, upper_right: Point },
    Polygon(Vec<Point>),
    Circle { center: Point, radius: f64 },
    CenterSphere { center: Point, radius: f64 },
    /// A GeoJSON geometry document.
    Geometry(Document),
}

impl Shape {
    fn operand(&self) -> Document {
        match self {
            Self::Box {
                bottom_left,
                upper_right,
            } => doc! { "$box": [bottom_left.pair(), upper_right.pair()] },
            Self::Polygon(points) => {
                doc! { "$polygon": points.iter().map(|point| point.pair()).collect::<Vec<_>>() }
            }
            Self::Circle { center, radius } => doc! { "$center": [center.pair(), *radius] },
            Self::CenterSphere { center, radius } => {
                doc! { "$centerSphere": [center.pair(), *radius] }
            }
            Self::Geometry(geometry) => doc! { "$geometry": geometry.clone() },
        }
    }
}

/// Operators for a proximity condition.
pub(crate) fn near(point: Point, max_distance: Option<f64>, legacy: bool) -> Document {
    let mut operators = if legacy {
        doc! { "$near": point.pair() }
    } else {
        doc! { "$near": { "$geometry": point.geometry() } }
    };

    if let Some(max_distance) = max_distance {
        if legacy {
            operators.insert("$maxDistance", max_distance);
        } else if let Ok(near) = operators.get_document_mut("$near") {
            near.insert("$maxDistance", max_distance);
        }
    }

    operators
}

/// Operators for a containment condition.
pub(crate) fn within(shape: &Shape, legacy: bool) -> Document {
    let operator = if legacy { "$within" } else { "$geoWithin" };
    doc! { operator: shape.operand() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_layers_over_equality() {
        let mut conditions = doc! { "age": 30 };
        apply_operator(&mut conditions, "age", "$lte", Bson::Int32(40));
        apply_operator(&mut conditions, "age", "$gte", Bson::Int32(18));

        assert_eq!(
            conditions,
            doc! { "age": { "$eq": 30, "$lte": 40, "$gte": 18 } }
        );
    }

    #[test]
    fn later_merge_wins() {
        let mut conditions = doc! { "age": { "$gte": 1 } };
        deep_merge(&mut conditions, &doc! { "age": { "$gte": 5 } });

        assert_eq!(conditions, doc! { "age": { "$gte": 5 } });
    }

    #[test]
    fn selection_rejects_mixed_polarity() {
        let mut fields = None;
        let mut forced = Vec::new();

        select(&mut fields, &mut forced, "a b".into()).unwrap();
        let error = select(&mut fields, &mut forced, "-c".into()).unwrap_err();

        assert!(matches!(error, Error::ParameterShape { parameter: "fields", .. }));
        assert_eq!(fields, Some(doc! { "a": 1, "b": 1 }));
    }

    #[test]
    fn selection_allows_id_exclusion_and_directives() {
        let mut fields = None;
        let mut forced = Vec::new();

        select(&mut fields, &mut forced, "name -_id +secret".into()).unwrap();
        select(
            &mut fields,
            &mut forced,
            doc! { "tags": { "$slice": 2 } }.into(),
        )
        .unwrap();

        assert_eq!(
            fields,
            Some(doc! { "name": 1, "_id": 0, "tags": { "$slice": 2 } })
        );
        assert_eq!(forced, vec!["secret".to_owned()]);
    }

    #[test]
    fn selection_mapping_rejects_strings() {
        let error = select(&mut None, &mut Vec::new(), doc! { "a": "yes" }.into()).unwrap_err();

        assert!(matches!(error, Error::ParameterShape { .. }));
    }

    #[test]
    fn discriminator_keeps_conflicting_caller_value() {
        let discriminator = Discriminator {
            key: "kind".to_owned(),
            value: Bson::from("Admin"),
        };

        let mut conditions = doc! { "name": "x", "kind": "Guest" };
        inject_discriminator(&mut conditions, &discriminator);
        inject_discriminator(&mut conditions, &discriminator);

        assert_eq!(
            conditions,
            doc! { "name": "x", "$and": [ { "kind": "Guest" } ], "kind": "Admin" }
        );
    }

    #[test]
    fn legacy_geo_operators() {
        let point = Point::new(1.0, 2.0);

        assert_eq!(
            near(point, Some(5.0), true),
            doc! { "$near": [1.0, 2.0], "$maxDistance": 5.0 }
        );
        assert_eq!(
            near(point, None, false),
            doc! { "$near": { "$geometry": { "type": "Point", "coordinates": [1.0, 2.0] } } }
        );

        let shape = Shape::Circle {
            center: point,
            radius: 3.0,
        };
        assert_eq!(
            within(&shape, false),
            doc! { "$geoWithin": { "$center": [[1.0, 2.0], 3.0] } }
        );
        assert!(within(&shape, true).contains_key("$within"));
    }

    #[test]
    fn hidden_paths_are_excluded_unless_forced() {
        let schema = Schema::new("User")
            .path("name", crate::schema::FieldType::String)
            .with_path(
                "password",
                crate::schema::SchemaPath::new(crate::schema::FieldType::String).hidden(),
            );

        assert_eq!(
            effective_projection(&schema, None, &[]),
            Some(doc! { "password": 0 })
        );
        assert_eq!(
            effective_projection(&schema, None, &["password".to_owned()]),
            None
        );
        assert_eq!(
            effective_projection(&schema, Some(&doc! { "name": 1 }), &[]),
            Some(doc! { "name": 1 })
        );
    }
}
