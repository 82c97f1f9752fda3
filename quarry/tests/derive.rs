mod common;

use common::connect;
use quarry::{
    Error, FieldType, Model, ValidationContext,
    bson::{Bson, DateTime, doc, oid::ObjectId},
};
use serde::Deserialize;

#[derive(Debug, Deserialize, Model)]
#[allow(dead_code)]
struct AccountModel {
    #[serde(rename = "_id")]
    id: ObjectId,
    #[model(required)]
    email: String,
    #[model(min = 0, max = 120)]
    age: Option<u8>,
    #[model(hidden)]
    secret: Option<String>,
    #[model(default = "free")]
    plan: String,
    #[model(default = 3)]
    seats: i32,
    #[model(default = false)]
    archived: bool,
    roles: Vec<String>,
    created: DateTime,
    verified: bool,
    #[model(reference = "accounts")]
    invited_by: Option<ObjectId>,
    extra: Bson,
}

#[derive(Debug, Deserialize, Model)]
#[model(
    collection = "accounts",
    discriminator(key = "kind", value = "Staff"),
    strict = false,
    strict_query = true
)]
#[allow(dead_code)]
struct Staff {
    #[serde(rename = "_id")]
    id: ObjectId,
    desk: i32,
}

#[test]
fn collection_name_defaults_to_snake_case() {
    assert_eq!(AccountModel::COLLECTION_NAME, "account");
    assert_eq!(Staff::COLLECTION_NAME, "accounts");
}

#[test]
fn field_types_follow_rust_types() {
    let schema = AccountModel::schema();

    assert_eq!(schema.name(), "AccountModel");
    assert_eq!(schema.resolve_type("_id"), Some(&FieldType::ObjectId));
    assert_eq!(schema.resolve_type("email"), Some(&FieldType::String));
    assert_eq!(schema.resolve_type("age"), Some(&FieldType::Number));
    assert_eq!(
        schema.resolve_type("roles"),
        Some(&FieldType::array(FieldType::String))
    );
    assert_eq!(schema.resolve_type("created"), Some(&FieldType::Date));
    assert_eq!(schema.resolve_type("verified"), Some(&FieldType::Boolean));
    assert_eq!(schema.resolve_type("extra"), Some(&FieldType::Mixed));
}

#[test]
fn field_attributes_become_schema_options() {
    let schema = AccountModel::schema();

    assert_eq!(schema.hidden_paths().collect::<Vec<_>>(), ["secret"]);
    assert_eq!(schema.default_value_for("plan"), Some(&Bson::from("free")));
    assert_eq!(schema.default_value_for("seats"), Some(&Bson::Int32(3)));
    assert_eq!(schema.default_value_for("archived"), Some(&Bson::Boolean(false)));
    assert_eq!(schema.reference_for("invited_by"), Some("accounts"));

    let errors = schema.run_field_validators("age", &Bson::Int32(121), ValidationContext::Query);
    assert_eq!(errors[0].kind, "max");

    let errors = schema.run_field_validators("email", &Bson::Null, ValidationContext::Document);
    assert_eq!(errors[0].kind, "required");
}

#[test]
fn struct_attributes_configure_the_schema() {
    let schema = Staff::schema();

    assert!(!schema.strict());
    assert_eq!(schema.strict_query(), Some(true));
    assert_eq!(schema.discriminator_mapping().unwrap().key, "kind");

    let (_, connection) = connect();
    let query = Staff::find(&connection, doc! { "desk": "4" });
    assert_eq!(query.cast().unwrap(), doc! { "desk": 4, "kind": "Staff" });

    let query = Staff::find(&connection, doc! { "floor": 2 });
    assert!(matches!(query.cast(), Err(Error::StrictMode { path }) if path == "floor"));
}
