mod common;

use common::{Admin, Person, Picky, Post, Ticket, connect, connect_with, seed_people};
use quarry::{
    Config, DriverError, Error, Model, Outcome, Record, UpdateOutcome,
    bson::{Bson, doc},
};

#[tokio::test]
async fn re_dispatch_repeats_the_same_request() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::find(&connection, doc! { "age": { "$gte": "30" } });
    query.sort("-age").unwrap().limit(5);

    query.exec().await.unwrap();
    query.exec().await.unwrap();

    let calls = driver.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
    assert_eq!(calls[0].method, "find");
    assert_eq!(calls[0].namespace, "people");
    assert_eq!(calls[0].filter, doc! { "age": { "$gte": 30 } });
    assert_eq!(calls[0].options.sort, Some(doc! { "age": -1 }));
    assert_eq!(calls[0].options.limit, Some(5));
}

#[tokio::test]
async fn cast_failure_never_reaches_the_driver() {
    let (driver, connection) = connect();

    let mut query = Person::find(&connection, doc! { "age": "abc" });

    let error = query.exec().await.unwrap_err();
    assert!(matches!(&error, Error::Cast(cast) if cast.path == "age"));
    assert!(matches!(query.error(), Some(Error::Cast(_))));

    let again = query.exec().await.unwrap_err();
    assert!(matches!(again, Error::Cast(_)));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn pending_error_short_circuits() {
    let (driver, connection) = connect();

    let mut query = Person::find(&connection, doc! {});
    query.set_error(Some(Error::StrictMode {
        path: "x".to_owned(),
    }));

    assert!(matches!(
        query.exec().await,
        Err(Error::StrictMode { path }) if path == "x"
    ));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn missing_operation_is_a_shape_error() {
    let (_, connection) = connect();

    let mut query = Person::query(&connection);

    assert!(matches!(
        query.exec().await,
        Err(Error::ParameterShape {
            parameter: "operation",
            ..
        })
    ));
}

#[tokio::test]
async fn find_hydrates_in_order_and_hides_hidden_paths() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::find(&connection, doc! {});
    query.sort("age").unwrap();

    let records = query.exec().await.unwrap().many().unwrap();
    let people: Vec<Person> = records.into_iter().filter_map(Record::instance).collect();

    let names: Vec<&str> = people.iter().map(|person| person.name.as_str()).collect();
    assert_eq!(names, ["ann", "kit", "bob"]);
    assert!(people.iter().all(|person| person.password.is_none()));
    assert_eq!(
        driver.calls()[0].options.projection,
        Some(doc! { "password": 0 })
    );
}

#[tokio::test]
async fn forced_hidden_path_is_returned() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::find_one(&connection, doc! { "name": "kit" });
    query.select("+password").unwrap();

    let person = query.exec().await.unwrap().one().unwrap().unwrap().instance().unwrap();

    assert_eq!(person.password.as_deref(), Some("hunter2"));
    assert_eq!(driver.calls()[0].options.projection, None);
}

#[tokio::test]
async fn lean_delivers_raw_documents() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::find(&connection, doc! { "name": "kit" });
    query.lean(true).select("name").unwrap();

    let records = query.exec().await.unwrap().many().unwrap();
    let document = records[0].as_lean().unwrap();

    assert_eq!(document.get_str("name").unwrap(), "kit");
    assert!(document.get("age").is_none());
    assert!(document.get("_id").is_some());
}

#[tokio::test]
async fn count_and_distinct_return_values_as_is() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut count = Person::count(&connection, doc! { "age": { "$gt": "26" } });
    assert_eq!(count.exec().await.unwrap().count(), Some(2));

    let mut distinct = Person::distinct(&connection, "tags", doc! {});
    let values = distinct.exec().await.unwrap().distinct().unwrap();

    assert_eq!(values, vec![Bson::from("a"), Bson::from("b")]);
    assert_eq!(driver.calls()[1].field.as_deref(), Some("tags"));
}

#[tokio::test]
async fn discriminated_model_only_sees_its_kind() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Admin::find(&connection, doc! {});
    let admins: Vec<Admin> = query
        .exec()
        .await
        .unwrap()
        .many()
        .unwrap()
        .into_iter()
        .filter_map(Record::instance)
        .collect();

    assert_eq!(admins.len(), 1);
    assert_eq!(admins[0].name, "bob");
    assert_eq!(driver.calls()[0].filter, doc! { "kind": "Admin" });
}

#[tokio::test]
async fn empty_find_and_update_degrades_to_a_lookup() {
    let (driver, connection) = connect();
    seed_people(&driver);
    let before = driver.documents("people");

    let mut query = Person::find_one_and_update(&connection, doc! { "name": "kit" }, doc! {});
    let person = query.exec().await.unwrap().one().unwrap().unwrap().instance().unwrap();

    assert_eq!(person.name, "kit");
    assert_eq!(driver.documents("people"), before);
    assert_eq!(driver.calls()[0].method, "findOne");
}

#[tokio::test]
async fn empty_update_is_not_sent() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::update_one(&connection, doc! { "name": "kit" }, doc! { "$set": {} });
    let outcome = query.exec().await.unwrap();

    assert_eq!(outcome.updated(), Some(&UpdateOutcome {
        acknowledged: false,
        matched_count: 0,
        modified_count: 0,
        upserted_id: None,
    }));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn update_sugar_folds_into_existing_set() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::update_one(
        &connection,
        doc! { "name": "kit" },
        doc! { "$set": { "age": "32" }, "tags": ["x"] },
    );
    let outcome = query.exec().await.unwrap();

    assert_eq!(outcome.updated().unwrap().modified_count, 1);
    assert_eq!(
        driver.calls()[0].document,
        Some(doc! { "$set": { "age": 32, "tags": ["x"] } })
    );

    let stored = &driver.documents("people")[0];
    assert_eq!(stored.get_i32("age").unwrap(), 32);
}

#[tokio::test]
async fn update_many_and_multi_flag() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::query(&connection);
    query
        .update(doc! { "$inc": { "age": 1 } })
        .set_options(doc! { "multi": true })
        .unwrap();

    let outcome = query.exec().await.unwrap();

    assert_eq!(outcome.updated().unwrap().matched_count, 3);
    assert_eq!(driver.calls()[0].method, "updateMany");
}

#[tokio::test]
async fn defaults_are_set_on_upsert() {
    let (driver, connection) = connect();

    let mut query = Person::update_one(
        &connection,
        doc! { "name": "new" },
        doc! { "$set": { "age": 5 } },
    );
    query
        .set_options(doc! { "upsert": true, "setDefaultsOnInsert": true })
        .unwrap();

    let outcome = query.exec().await.unwrap();
    assert!(outcome.updated().unwrap().upserted_id.is_some());

    assert_eq!(
        driver.calls()[0].document,
        Some(doc! { "$set": { "age": 5, "status": "active" } })
    );

    let stored = &driver.documents("people")[0];
    assert_eq!(stored.get_str("name").unwrap(), "new");
    assert_eq!(stored.get_str("status").unwrap(), "active");
}

#[tokio::test]
async fn empty_upsert_is_still_sent() {
    let (driver, connection) = connect();

    let mut query = Person::update_one(&connection, doc! { "name": "new" }, doc! {});
    query
        .set_options(doc! { "upsert": true, "setDefaultsOnInsert": true })
        .unwrap();

    let outcome = query.exec().await.unwrap();
    let outcome = outcome.updated().unwrap();
    assert!(outcome.acknowledged);
    assert!(outcome.upserted_id.is_some());

    let calls = driver.calls();
    assert_eq!(calls[0].method, "updateOne");
    assert_eq!(calls[0].document, Some(doc! { "$set": { "status": "active" } }));

    let stored = &driver.documents("people")[0];
    assert_eq!(stored.get_str("name").unwrap(), "new");
    assert_eq!(stored.get_str("status").unwrap(), "active");

    driver.clear_calls();
    let mut query = Person::update_one(&connection, doc! { "name": "solo" }, doc! {});
    query.set_options(doc! { "upsert": true }).unwrap();

    let outcome = query.exec().await.unwrap();
    assert!(outcome.updated().unwrap().upserted_id.is_some());
    assert_eq!(driver.calls()[0].document, Some(doc! { "$setOnInsert": {} }));
    assert_eq!(driver.documents("people")[1].get_str("name").unwrap(), "solo");
}

#[tokio::test]
async fn update_validators_run_when_requested() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::update_one(&connection, doc! { "name": "kit" }, doc! { "age": -1 });

    query.set_options(doc! { "runValidators": true }).unwrap();
    match query.exec().await {
        Err(Error::Validation(error)) => {
            assert_eq!(error.path("age").unwrap().kind, "min");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(driver.calls().is_empty());

    let (driver, connection) = connect_with(Config {
        run_validators: true,
        ..Config::default()
    });
    let mut query = Person::update_one(&connection, doc! {}, doc! { "$unset": { "name": 1 } });

    assert!(matches!(query.exec().await, Err(Error::Validation(_))));
    assert!(driver.calls().is_empty());
}

#[tokio::test]
async fn replacement_is_validated_as_a_whole() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::replace_one(&connection, doc! { "name": "kit" }, doc! { "age": 3 });
    match query.exec().await {
        Err(Error::Validation(error)) => {
            assert_eq!(error.path("name").unwrap().kind, "required");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }

    let mut query = Person::replace_one(
        &connection,
        doc! { "name": "kit" },
        doc! { "name": "kat", "age": "3" },
    );
    query.exec().await.unwrap();

    assert_eq!(driver.calls()[0].document, Some(doc! { "name": "kat", "age": 3 }));
    assert_eq!(driver.documents("people")[0].get_str("name").unwrap(), "kat");
}

#[tokio::test]
async fn find_one_and_update_returns_the_requested_image() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::find_one_and_update(
        &connection,
        doc! { "name": "kit" },
        doc! { "$inc": { "age": 1 } },
    );
    query.set_options(doc! { "new": true }).unwrap();

    let person = query.exec().await.unwrap().one().unwrap().unwrap().instance().unwrap();

    assert_eq!(person.age, Some(32));
    assert_eq!(driver.calls()[0].options.return_new, Some(true));
}

#[tokio::test]
async fn find_one_and_update_can_overwrite() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query =
        Person::find_one_and_update(&connection, doc! { "name": "kit" }, doc! { "age": 3 });
    query.set_options(doc! { "overwrite": true }).unwrap();

    match query.exec().await {
        Err(Error::Validation(error)) => {
            assert_eq!(error.path("name").unwrap().kind, "required");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(driver.calls().is_empty());

    let mut query = Person::find_one_and_update(
        &connection,
        doc! { "name": "kit" },
        doc! { "name": "kat", "age": "3" },
    );
    query
        .set_options(doc! { "overwrite": true, "new": true })
        .unwrap();

    let person = query.exec().await.unwrap().one().unwrap().unwrap().instance().unwrap();
    assert_eq!(person.name, "kat");
    assert_eq!(person.age, Some(3));
    assert!(person.tags.is_empty());

    let calls = driver.calls();
    assert_eq!(calls[0].method, "findOneAndUpdate");
    assert_eq!(calls[0].document, Some(doc! { "name": "kat", "age": 3 }));

    let stored = &driver.documents("people")[0];
    assert!(stored.contains_key("_id"));
    assert!(!stored.contains_key("tags"));
    assert!(!stored.contains_key("password"));
}

#[tokio::test]
async fn raw_result_delivers_the_envelope() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::find_one_and_update(
        &connection,
        doc! { "name": "kit" },
        doc! { "age": 50 },
    );
    query.set_options(doc! { "rawResult": true }).unwrap();

    let raw = query.exec().await.unwrap().raw().unwrap();

    assert_eq!(raw.last_error_object.updated_existing, Some(true));
    assert_eq!(raw.value.unwrap().get_i32("age").unwrap(), 31);
}

#[tokio::test]
async fn find_one_and_remove_deletes_the_match() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::find_one_and_remove(&connection, doc! { "name": "ann" });
    let person = query.exec().await.unwrap().one().unwrap().unwrap().instance().unwrap();

    assert_eq!(person.name, "ann");
    assert_eq!(driver.documents("people").len(), 2);
    assert_eq!(driver.calls()[0].method, "findOneAndDelete");
}

#[tokio::test]
async fn remove_honours_single() {
    let (driver, connection) = connect();
    seed_people(&driver);

    let mut query = Person::query(&connection);
    query
        .remove()
        .set_options(doc! { "single": true })
        .unwrap();

    let outcome = query.exec().await.unwrap();

    assert_eq!(outcome.deleted().unwrap().deleted_count, 1);
    assert_eq!(driver.calls()[0].method, "deleteOne");
    assert_eq!(driver.documents("people").len(), 2);

    let mut query = Person::delete_many(&connection, doc! {});
    let outcome = query.exec().await.unwrap();
    assert_eq!(outcome.deleted().unwrap().deleted_count, 2);
}

#[tokio::test]
async fn or_fail_turns_empty_results_into_errors() {
    let (_, connection) = connect();

    let mut query = Person::find_one(&connection, doc! { "name": "nobody" });
    assert!(matches!(query.exec().await, Ok(Outcome::One(None))));

    query.or_fail();
    assert!(matches!(
        query.exec().await,
        Err(Error::DocumentNotFound { model: "Person" })
    ));

    let mut query = Person::delete_one(&connection, doc! { "name": "nobody" });
    query.or_fail();
    assert!(matches!(query.exec().await, Err(Error::DocumentNotFound { .. })));

    let mut query = Person::update_one(&connection, doc! { "name": "nobody" }, doc! { "age": 1 });
    query.or_fail();
    assert!(matches!(query.exec().await, Err(Error::DocumentNotFound { .. })));
}

#[tokio::test]
async fn driver_errors_pass_through_unchanged() {
    let (driver, connection) = connect();
    seed_people(&driver);
    driver.fail_next(DriverError::message("duplicate key"));

    let mut query = Person::find(&connection, doc! {});
    let error = query.exec().await.unwrap_err();

    assert!(matches!(error, Error::Driver(_)));
    assert_eq!(error.to_string(), "driver error: duplicate key");
    assert!(query.error().is_none());

    assert_eq!(query.exec().await.unwrap().many().unwrap().len(), 3);
}

#[tokio::test]
async fn options_reach_the_driver() {
    let (driver, connection) = connect();

    let mut query = Person::find(&connection, doc! {});
    query
        .set_options(doc! {
            "skip": 2,
            "maxTimeMS": 100,
            "comment": "audit",
            "readPreference": "secondaryPreferred",
            "allowDiskUse": true,
            "collation": { "locale": "en" },
        })
        .unwrap();

    query.exec().await.unwrap();

    let options = &driver.calls()[0].options;
    assert_eq!(options.skip, Some(2));
    assert_eq!(options.max_time, Some(std::time::Duration::from_millis(100)));
    assert_eq!(options.comment, Some(Bson::from("audit")));
    assert!(options.read_preference.is_some());
    assert_eq!(options.extra, doc! { "allowDiskUse": true });
    assert_eq!(options.collation, Some(doc! { "locale": "en" }));
}

#[tokio::test]
async fn schema_collation_is_the_default() {
    let (driver, connection) = connect();
    let collation = doc! { "locale": "en", "strength": 2 };

    let mut query = Ticket::find(&connection, doc! { "title": "Login" });
    assert_eq!(query.options().collation, Some(collation.clone()));

    query.exec().await.unwrap();
    assert_eq!(driver.calls()[0].options.collation, Some(collation));

    let mut query = Ticket::find(&connection, doc! { "title": "Login" });
    query
        .set_options(doc! { "collation": { "locale": "fr" } })
        .unwrap();

    query.exec().await.unwrap();
    assert_eq!(driver.calls()[1].options.collation, Some(doc! { "locale": "fr" }));
}

#[tokio::test]
async fn validation_context_reaches_custom_validators() {
    let (driver, connection) = connect();
    driver.insert("tickets", doc! { "title": "Login" });

    let mut query =
        Ticket::update_one(&connection, doc! { "title": "Login" }, doc! { "code": "T-1" });
    query
        .set_options(doc! { "runValidators": true, "context": "query" })
        .unwrap();

    match query.exec().await {
        Err(Error::Validation(error)) => {
            assert_eq!(error.path("code").unwrap().kind, "documentOnly");
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert!(driver.calls().is_empty());

    let mut query =
        Ticket::update_one(&connection, doc! { "title": "Login" }, doc! { "code": "T-1" });
    query.set_options(doc! { "runValidators": true }).unwrap();

    let outcome = query.exec().await.unwrap();
    assert_eq!(outcome.updated().unwrap().modified_count, 1);
    assert_eq!(driver.calls()[0].document, Some(doc! { "$set": { "code": "T-1" } }));
}

#[tokio::test]
async fn references_are_populated_before_hydration() {
    let (driver, connection) = connect();
    let ids = seed_people(&driver);
    driver.insert("posts", doc! { "title": "hello", "author": ids[1].clone() });

    let mut query = Post::find_one(&connection, doc! { "title": "hello" });
    query.populate("author");

    let post = query.exec().await.unwrap().one().unwrap().unwrap().instance().unwrap();

    let Bson::Document(author) = post.author else {
        panic!("author was not populated: {:?}", post.author);
    };
    assert_eq!(author.get_str("name").unwrap(), "ann");

    let calls = driver.calls();
    assert_eq!(calls[1].namespace, "people");
    assert_eq!(calls[1].filter, doc! { "_id": { "$in": [ids[1].clone()] } });
}

#[tokio::test]
async fn lean_results_are_still_populated() {
    let (driver, connection) = connect();
    let ids = seed_people(&driver);
    driver.insert("posts", doc! { "title": "hello", "author": ids[0].clone() });

    let mut query = Post::find(&connection, doc! {});
    query.lean(true).populate("author");

    let records = query.exec().await.unwrap().many().unwrap();
    let post = records[0].as_lean().unwrap();

    assert_eq!(
        post.get_document("author").unwrap().get_str("name").unwrap(),
        "kit"
    );
}

#[tokio::test]
async fn hydration_reports_the_first_failing_record() {
    let (driver, connection) = connect();
    driver.insert_many(
        "picky",
        [
            doc! { "name": "good" },
            doc! { "name": "bad1" },
            doc! { "name": "bad2" },
        ],
    );

    let mut query = Picky::find(&connection, doc! {});

    match query.exec().await {
        Err(Error::Hydration { index, message }) => {
            assert_eq!(index, 1);
            assert_eq!(message, "bad1");
        }
        other => panic!("expected a hydration error, got {other:?}"),
    }
    assert!(query.error().is_none());

    query.lean(true);
    assert_eq!(query.exec().await.unwrap().many().unwrap().len(), 3);
}
