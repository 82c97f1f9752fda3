//! Casting of filters and update documents against a [`Schema`].

use crate::{
    Error, Result,
    error::ValidationError,
    path,
    schema::{FieldType, Schema, ValidationContext},
};
use mongodb::bson::{Bson, Document};

/// Operators whose operand is left as given.
const PASSTHROUGH: &[&str] = &[
    "$regex",
    "$options",
    "$mod",
    "$type",
    "$near",
    "$nearSphere",
    "$geoWithin",
    "$within",
    "$geoIntersects",
    "$geometry",
    "$maxDistance",
    "$minDistance",
    "$elemMatch",
];

fn unknown_path(path: &str, value: &Bson, strict: bool) -> Result<Bson> {
    if strict {
        Err(Error::StrictMode {
            path: path.to_owned(),
        })
    } else {
        Ok(value.clone())
    }
}

/// Casts a single value at `path`; scalars written to array paths are cast to
/// the element type.
fn cast_value(schema: &Schema, path: &str, ty: &FieldType, value: &Bson) -> Result<Bson> {
    let target = match (ty, value) {
        (FieldType::Array(inner), value) if !matches!(value, Bson::Array(_)) => inner.as_ref(),
        (ty, _) => ty,
    };

    target
        .cast(value)
        .map_err(|()| schema.cast_error(path, value, target).into())
}

fn cast_elements(schema: &Schema, path: &str, ty: &FieldType, operand: &Bson) -> Result<Bson> {
    match operand {
        Bson::Array(items) => items
            .iter()
            .map(|item| cast_value(schema, path, ty.element(), item))
            .collect::<Result<Vec<_>>>()
            .map(Bson::Array),
        single => cast_value(schema, path, ty.element(), single),
    }
}

fn cast_condition(schema: &Schema, path: &str, value: &Bson, strict: bool) -> Result<Bson> {
    let Some(ty) = schema.resolve_type(path) else {
        return unknown_path(path, value, strict);
    };

    let Bson::Document(operators) = value else {
        return cast_value(schema, path, ty, value);
    };

    if !path::has_operators(operators) {
        return cast_value(schema, path, ty, value);
    }

    let mut cast = Document::new();

    for (operator, operand) in operators {
        let operand = match operator.as_str() {
            "$in" | "$nin" | "$all" => cast_elements(schema, path, ty, operand)?,
            "$exists" => Bson::Boolean(match operand {
                Bson::Boolean(flag) => *flag,
                Bson::Null | Bson::Undefined => false,
                Bson::Int32(n) => *n != 0,
                Bson::Int64(n) => *n != 0,
                _ => true,
            }),
            "$size" => cast_value(schema, path, &FieldType::Number, operand)?,
            "$not" => match operand {
                Bson::Document(_) => cast_condition(schema, path, operand, strict)?,
                other => other.clone(),
            },
            operator if PASSTHROUGH.contains(&operator) => operand.clone(),
            _ => cast_value(schema, path, ty, operand)?,
        };

        cast.insert(operator.clone(), operand);
    }

    Ok(Bson::Document(cast))
}

/// Casts every path of `filter`, descending into `$and`, `$or` and `$nor`.
pub(crate) fn cast_filter(schema: &Schema, filter: &Document, strict: bool) -> Result<Document> {
    let mut cast = Document::new();

    for (key, value) in filter {
        let value = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let Bson::Array(clauses) = value else {
                    return Err(Error::shape(
                        "filter",
                        "Query::cast",
                        format!("{key} must be an array of documents"),
                    ));
                };

                clauses
                    .iter()
                    .map(|clause| match clause {
                        Bson::Document(clause) => cast_filter(schema, clause, strict).map(Bson::Document),
                        other => Err(Error::shape(
                            "filter",
                            "Query::cast",
                            format!("{key} clause must be a document, got {other}"),
                        )),
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(Bson::Array)?
            }
            operator if path::is_operator(operator) => value.clone(),
            path => cast_condition(schema, path, value, strict)?,
        };

        cast.insert(key.clone(), value);
    }

    Ok(cast)
}

/// Casts a value assigned to `path`, walking into embedded documents whose
/// children are declared individually.
fn cast_assignment(schema: &Schema, path: &str, value: &Bson, strict: bool) -> Result<Bson> {
    if let Some(ty) = schema.resolve_type(path) {
        return ty
            .cast(value)
            .map_err(|()| schema.cast_error(path, value, ty).into());
    }

    match value {
        Bson::Document(children) if schema.has_children(path) => {
            let mut cast = Document::new();
            for (key, child) in children {
                let nested = format!("{path}.{key}");
                cast.insert(key.clone(), cast_assignment(schema, &nested, child, strict)?);
            }
            Ok(Bson::Document(cast))
        }
        _ => unknown_path(path, value, strict),
    }
}

fn cast_push(schema: &Schema, path: &str, operand: &Bson, strict: bool) -> Result<Bson> {
    let Some(ty) = schema.resolve_type(path) else {
        return unknown_path(path, operand, strict);
    };

    match operand {
        Bson::Document(modifiers) if modifiers.contains_key("$each") => {
            let mut cast = modifiers.clone();
            if let Some(each) = modifiers.get("$each") {
                cast.insert("$each", cast_elements(schema, path, ty, each)?);
            }
            Ok(Bson::Document(cast))
        }
        single => cast_value(schema, path, ty.element(), single),
    }
}

fn cast_pull(schema: &Schema, path: &str, operand: &Bson, strict: bool) -> Result<Bson> {
    let Some(ty) = schema.resolve_type(path) else {
        return unknown_path(path, operand, strict);
    };

    match operand {
        Bson::Document(condition) if path::has_operators(condition) => {
            cast_condition(schema, path, operand, strict)
        }
        Bson::Document(_) => Ok(operand.clone()),
        single => cast_value(schema, path, ty.element(), single),
    }
}

/// Folds bare paths into `$set`, keeping an existing `$set` bucket.
pub(crate) fn fold_sugar(update: &Document) -> Document {
    let mut folded = Document::new();
    let mut sugar = Document::new();

    for (key, value) in update {
        if path::is_operator(key) {
            folded.insert(key.clone(), value.clone());
        } else {
            sugar.insert(key.clone(), value.clone());
        }
    }

    if !sugar.is_empty() {
        match folded.get_mut("$set") {
            Some(Bson::Document(set)) => {
                for (key, value) in sugar {
                    set.insert(key, value);
                }
            }
            _ => {
                folded.insert("$set", sugar);
            }
        }
    }

    folded
}

/// Casts an update document operator by operator. Empty buckets are dropped.
pub(crate) fn cast_update(
    schema: &Schema,
    update: &Document,
    strict: bool,
    omit_undefined: bool,
) -> Result<Document> {
    let mut cast = Document::new();

    for (operator, fields) in fold_sugar(update) {
        let Bson::Document(fields) = fields else {
            return Err(Error::shape(
                "update",
                "Query::update",
                format!("operator {operator} expects a document, got {fields}"),
            ));
        };

        let mut bucket = Document::new();

        for (path, value) in &fields {
            let value = &match value {
                Bson::Undefined if omit_undefined => continue,
                Bson::Undefined => Bson::Null,
                value => value.clone(),
            };

            let value = match operator.as_str() {
                "$set" | "$setOnInsert" | "$min" | "$max" => {
                    cast_assignment(schema, path, value, strict)?
                }
                "$inc" | "$mul" => match schema.resolve_type(path) {
                    Some(_) => cast_value(schema, path, &FieldType::Number, value)?,
                    None => unknown_path(path, value, strict)?,
                },
                "$push" | "$addToSet" => cast_push(schema, path, value, strict)?,
                "$pull" => cast_pull(schema, path, value, strict)?,
                "$pullAll" => match schema.resolve_type(path) {
                    Some(ty) => cast_elements(schema, path, ty, value)?,
                    None => unknown_path(path, value, strict)?,
                },
                "$unset" => match schema.resolve_type(path) {
                    Some(_) => Bson::String(String::new()),
                    None => unknown_path(path, &Bson::String(String::new()), strict)?,
                },
                _ => value.clone(),
            };

            bucket.insert(path.clone(), value);
        }

        if !bucket.is_empty() {
            cast.insert(operator, bucket);
        }
    }

    Ok(cast)
}

/// Casts and fully validates a whole replacement document.
pub(crate) fn cast_replacement(
    schema: &Schema,
    replacement: &Document,
    strict: bool,
    omit_undefined: bool,
) -> Result<Document> {
    if path::has_operators(replacement) {
        return Err(Error::shape(
            "replacement",
            "Query::replace_one",
            "must not contain update operators",
        ));
    }

    let mut cast = Document::new();

    for (path, value) in replacement {
        let value = &match value {
            Bson::Undefined if omit_undefined => continue,
            Bson::Undefined => Bson::Null,
            value => value.clone(),
        };

        cast.insert(path.clone(), cast_assignment(schema, path, value, strict)?);
    }

    schema.validate_document(&cast)?;

    Ok(cast)
}

/// Runs the validators of every path an update writes.
///
/// `$unset` paths are checked as if set to `null`, so only `required` can fail.
pub(crate) fn validate_update(
    schema: &Schema,
    update: &Document,
    context: ValidationContext,
) -> std::result::Result<(), ValidationError> {
    fn visit(
        schema: &Schema,
        path: &str,
        value: &Bson,
        context: ValidationContext,
        errors: &mut Vec<crate::error::ValidatorError>,
    ) {
        match value {
            Bson::Document(children)
                if schema.schema_path(path).is_none() && schema.has_children(path) =>
            {
                for (key, child) in children {
                    visit(schema, &format!("{path}.{key}"), child, context, errors);
                }
            }
            value => errors.extend(schema.run_field_validators(path, value, context)),
        }
    }

    let mut errors = Vec::new();

    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            continue;
        };

        match operator.as_str() {
            "$set" | "$setOnInsert" => {
                for (path, value) in fields {
                    visit(schema, path, value, context, &mut errors);
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    errors.extend(schema.run_field_validators(path, &Bson::Null, context));
                }
            }
            _ => {}
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            model: schema.name(),
            errors,
        })
    }
}

/// Paths constrained by equality in `filter`, including inside `$and`.
fn filter_paths(filter: &Document, paths: &mut Vec<String>) {
    for (key, value) in filter {
        match (key.as_str(), value) {
            ("$and", Bson::Array(clauses)) => {
                for clause in clauses.iter().filter_map(Bson::as_document) {
                    filter_paths(clause, paths);
                }
            }
            (key, _) if path::is_operator(key) => {}
            (key, _) => paths.push(key.to_owned()),
        }
    }
}

/// Writes schema defaults into `$set` for paths neither the filter nor the
/// update already mention.
pub(crate) fn apply_defaults_on_insert(schema: &Schema, filter: &Document, update: &mut Document) {
    let mut present = Vec::new();
    filter_paths(filter, &mut present);
    for fields in update.values().filter_map(Bson::as_document) {
        present.extend(fields.keys().cloned());
    }

    let defaults: Vec<(String, Bson)> = schema
        .paths()
        .filter_map(|(declared, _)| {
            let default = schema.default_value_for(declared)?;
            let mentioned = present.iter().any(|key| path::overlaps(key, declared));
            (!mentioned).then(|| (declared.to_owned(), default.clone()))
        })
        .collect();

    if defaults.is_empty() {
        return;
    }

    match update.get_mut("$set") {
        Some(Bson::Document(set)) => {
            for (path, value) in defaults {
                set.insert(path, value);
            }
        }
        _ => {
            update.insert("$set", defaults.into_iter().collect::<Document>());
        }
    }
}
