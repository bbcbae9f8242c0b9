use bson::{Binary, Bson, Document, doc, oid::ObjectId, spec::BinarySubtype};
use futures::TryStreamExt;
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docmapper::{
    DocumentStore, MappedType,
    backend::{FindOptions, StoreBackend},
    collection::{BulkRequest, CollectionOptions, SerializationStrategy},
    error::MapperError,
    memory::InMemoryStore,
    query::{DbQuery, DbUpdate, Pipeline, Projection, SortSpec},
    schema::FieldSchema,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, MappedType)]
#[docmapper(collection = "people")]
struct Person {
    #[serde(
        rename = "_id",
        with = "docmapper::codec::object_id",
        skip_serializing_if = "Option::is_none",
        default
    )]
    id: Option<String>,
    name: String,
    age: i32,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, MappedType)]
#[docmapper(collection = "tickets")]
struct Ticket {
    #[serde(
        rename = "_id",
        with = "docmapper::codec::uuid",
        skip_serializing_if = "Option::is_none",
        default
    )]
    id: Option<Uuid>,
    title: String,
}

fn person(name: &str, age: i32, tags: &[&str]) -> Person {
    Person {
        id: None,
        name: name.to_string(),
        age,
        tags: tags.iter().map(|tag| tag.to_string()).collect(),
    }
}

fn store() -> DocumentStore<InMemoryStore> {
    DocumentStore::new(InMemoryStore::new())
}

async fn stored(store: &DocumentStore<InMemoryStore>, collection: &str) -> Vec<Document> {
    store
        .backend()
        .find(doc! {}, FindOptions::default(), collection)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_insert_fills_in_native_ids() {
    let store = store();
    let people = store.collection::<Person>().unwrap();
    let alice = person("Alice", 30, &["admin"]);

    let result = people.insert_one(&alice).await.unwrap();
    let id = result.saved_object().unwrap().id.clone().unwrap();

    assert_eq!(id.len(), 24);
    assert!(ObjectId::parse_str(&id).is_ok());
    assert_eq!(result.saved_id::<String>().unwrap(), id);

    let found = people.find_one_by_id(&id).await.unwrap();
    assert_eq!(
        found,
        Some(Person {
            id: Some(id.clone()),
            ..alice
        })
    );

    let documents = stored(&store, "people").await;
    assert_eq!(documents.len(), 1);
    assert_eq!(
        documents[0].get("_id"),
        Some(&Bson::ObjectId(ObjectId::parse_str(&id).unwrap()))
    );
    assert_eq!(documents[0].iter().next().map(|(key, _)| key == "_id"), Some(true));
}

#[tokio::test]
async fn test_serde_with_module_supplies_the_id_codec() {
    let store = store();
    let people = store.collection::<Person>().unwrap();

    let schema = people.mapper().schema_for::<Person>();
    assert_eq!(schema.id().and_then(FieldSchema::codec_name), Some("object_id"));

    let id: String = people
        .insert_one(&person("Carol", 25, &[]))
        .await
        .unwrap()
        .saved_id()
        .unwrap();

    assert_eq!(
        people.find_one_by_id(&id).await.unwrap().map(|p| p.name),
        Some("Carol".to_string())
    );
    assert_eq!(
        people.manage_filter(DbQuery::is("_id", id.clone()).into()).unwrap(),
        doc! { "_id": ObjectId::parse_str(&id).unwrap() }
    );
    assert_eq!(people.count(DbQuery::is("_id", id.clone())).await.unwrap(), 1);
}

#[tokio::test]
async fn test_native_strategy_only_generates_object_ids() {
    let store = store();
    let tickets = store.collection::<Ticket>().unwrap();
    let id = Uuid::new_v4();
    let ticket = Ticket {
        id: Some(id),
        title: "first".to_string(),
    };

    let result = tickets.insert_one(&ticket).await.unwrap();
    assert_eq!(result.saved_object().unwrap(), &ticket);
    assert_eq!(result.saved_id::<Uuid>().unwrap(), id);

    let documents = stored(&store, "tickets").await;
    assert_eq!(
        documents[0].get("_id"),
        Some(&Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: id.as_bytes().to_vec(),
        }))
    );

    let untitled = Ticket {
        id: None,
        title: "second".to_string(),
    };
    assert!(matches!(
        tickets.insert_one(&untitled).await,
        Err(MapperError::Configuration(_))
    ));
    assert_eq!(stored(&store, "tickets").await.len(), 1);
    assert_eq!(tickets.find_one_by_id(&id).await.unwrap(), Some(ticket));
}

#[tokio::test]
async fn test_save_update_and_remove() {
    let store = store();
    let people = store.collection::<Person>().unwrap();

    let id: String = people
        .insert_one(&person("Bob", 40, &[]))
        .await
        .unwrap()
        .saved_id()
        .unwrap();

    let mut bob = people.find_one_by_id(&id).await.unwrap().unwrap();
    bob.age = 41;
    people.save(&bob).await.unwrap();
    assert_eq!(people.count(DbQuery::empty()).await.unwrap(), 1);

    let outcome = people
        .update_by_id(&id, DbUpdate::inc("age", 1).push("tags", "veteran"))
        .await
        .unwrap();
    assert_eq!(outcome.matched, 1);

    let bob = people.find_one_by_id(&id).await.unwrap().unwrap();
    assert_eq!(bob.age, 42);
    assert_eq!(bob.tags, vec!["veteran".to_string()]);

    people.insert_one(&person("Cid", 12, &[])).await.unwrap();
    let outcome = people
        .update_many(DbQuery::greater_than("age", 18), DbUpdate::set("name", "Robert"))
        .await
        .unwrap();
    assert_eq!(outcome.matched, 1);
    assert_eq!(people.count(DbQuery::is("name", "Robert")).await.unwrap(), 1);

    assert_eq!(people.remove_by_id(&id).await.unwrap().deleted, 1);
    assert_eq!(people.find_one_by_id(&id).await.unwrap(), None);
    assert_eq!(people.remove(DbQuery::empty()).await.unwrap().deleted, 1);
}

#[tokio::test]
async fn test_upsert_by_query() {
    let store = store();
    let people = store.collection::<Person>().unwrap();

    let outcome = people
        .update(
            DbQuery::is("name", "Dora"),
            DbUpdate::set("age", 28).set_on_insert("tags", vec!["new"]),
            true,
            false,
        )
        .await
        .unwrap();
    assert!(outcome.upserted_id.is_some());

    let dora = people.find_one(DbQuery::is("name", "Dora")).await.unwrap().unwrap();
    assert_eq!(dora.age, 28);
    assert_eq!(dora.tags, vec!["new".to_string()]);
}

#[tokio::test]
async fn test_cursor_options() {
    let store = store();
    let people = store.collection::<Person>().unwrap();
    people
        .insert_many(&[
            person("Ann", 25, &["admin"]),
            person("Ben", 35, &["admin", "ops"]),
            person("Cat", 45, &[]),
            person("Dan", 15, &["ops"]),
        ])
        .await
        .unwrap();

    let mut cursor = people.find(DbQuery::greater_than_equals("age", 20));
    cursor
        .sort(SortSpec::new().descending("age"))
        .unwrap()
        .skip(1)
        .unwrap()
        .projection(Projection::new().exclude("tags"))
        .unwrap();

    let names: Vec<_> = cursor.to_vec().await.unwrap().into_iter().map(|p| (p.name, p.tags)).collect();
    assert_eq!(names, vec![("Ben".to_string(), vec![]), ("Ann".to_string(), vec![])]);

    let mut cursor = people.find(doc! { "age": { "$gt": 20 } });
    cursor.and(DbQuery::is("tags", "ops")).unwrap();
    let found = cursor.to_vec().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "Ben");
}

#[tokio::test]
async fn test_cursor_is_frozen_once_iterated() {
    let store = store();
    let people = store.collection::<Person>().unwrap();
    people
        .insert_many(&[person("Ann", 25, &[]), person("Ben", 35, &[])])
        .await
        .unwrap();

    let mut cursor = people.find_all();
    cursor.sort(SortSpec::new().ascending("name")).unwrap();

    assert_eq!(cursor.next().await.unwrap().map(|p| p.name), Some("Ann".to_string()));
    assert!(matches!(cursor.limit(1), Err(MapperError::IllegalState(_))));
    assert!(matches!(
        cursor.and(DbQuery::is("name", "Ben")),
        Err(MapperError::IllegalState(_))
    ));
    assert_eq!(cursor.next().await.unwrap().map(|p| p.name), Some("Ben".to_string()));
    assert_eq!(cursor.next().await.unwrap(), None);
}

#[tokio::test]
async fn test_distinct_decodes_through_field_codecs() {
    let store = store();
    let people = store.collection::<Person>().unwrap();
    let result = people
        .insert_many(&[person("Ann", 25, &["admin"]), person("Ben", 35, &["admin", "ops"])])
        .await
        .unwrap();

    let mut ids: Vec<String> = people.distinct("_id", DbQuery::empty()).await.unwrap();
    let mut expected: Vec<String> = result.saved_ids().unwrap();
    ids.sort();
    expected.sort();
    assert_eq!(ids, expected);

    let tags: Vec<String> = people.distinct("tags", DbQuery::empty()).await.unwrap();
    assert_eq!(tags, vec!["admin".to_string(), "ops".to_string()]);
}

#[tokio::test]
async fn test_aggregate_serializes_match_stages() {
    #[derive(Debug, PartialEq, Deserialize)]
    struct Name {
        name: String,
    }

    let store = store();
    let people = store.collection::<Person>().unwrap();
    let ann = people.insert_one(&person("Ann", 25, &["admin"])).await.unwrap();
    people
        .insert_many(&[person("Ben", 35, &["admin"]), person("Cat", 45, &[])])
        .await
        .unwrap();
    let ann_id: String = ann.saved_id().unwrap();

    let names: Vec<Name> = people
        .aggregate(
            Pipeline::new()
                .match_query(DbQuery::is("tags", "admin").not_equals("_id", ann_id))
                .sort(SortSpec::new().ascending("name"))
                .project(Projection::new().include("name").exclude("_id")),
        )
        .await
        .unwrap();

    assert_eq!(
        names,
        vec![Name {
            name: "Ben".to_string()
        }]
    );
}

#[tokio::test]
async fn test_bulk_write() {
    let store = store();
    let people = store.collection::<Person>().unwrap();

    let outcome = people
        .bulk_write(
            vec![
                BulkRequest::Insert(person("Dan", 20, &[])),
                BulkRequest::Insert(person("Eve", 22, &[])),
                BulkRequest::UpdateOne {
                    filter: DbQuery::is("name", "Dan").into(),
                    update: DbUpdate::set("age", 21).into(),
                    upsert: false,
                },
                BulkRequest::DeleteMany(DbQuery::greater_than("age", 21).into()),
            ],
            true,
        )
        .await
        .unwrap();

    assert_eq!(outcome.inserted, 2);
    assert_eq!(outcome.matched, 1);
    assert_eq!(outcome.modified, 1);
    assert_eq!(outcome.deleted, 1);
    assert_eq!(
        outcome.inserted_ids.iter().map(|(index, _)| *index).collect::<Vec<_>>(),
        vec![0, 1]
    );

    let remaining = people.find_all().to_vec().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!((remaining[0].name.as_str(), remaining[0].age), ("Dan", 21));
}

#[tokio::test]
async fn test_streaming_strategy_takes_ids_from_the_store() {
    let store = store();
    let people = store
        .collection_with_options::<Person>(
            "streamed",
            CollectionOptions::default().strategy(SerializationStrategy::Streaming),
        )
        .unwrap();

    let result = people.insert_one(&person("Fay", 33, &[])).await.unwrap();
    assert!(matches!(result.saved_object(), Err(MapperError::IllegalState(_))));

    let id: String = result.saved_id().unwrap();
    assert!(ObjectId::parse_str(&id).is_ok());
    assert_eq!(
        people.find_one_by_id(&id).await.unwrap().map(|p| p.name),
        Some("Fay".to_string())
    );
}

#[tokio::test]
async fn test_invalid_conditions_fail_on_execution() {
    let store = store();
    let people = store.collection::<Person>().unwrap();

    let err = people.find_one(DbQuery::is("$or", 1)).await.unwrap_err();
    assert!(matches!(err, MapperError::Configuration(_)));

    let err = people
        .find_one(DbQuery::is("_id", "not an object id"))
        .await
        .unwrap_err();
    assert!(matches!(err, MapperError::Field { ref path, .. } if path == "_id"));
}

#[tokio::test]
async fn test_unsupported_backend_features_pass_errors_through() {
    let store = store();
    let people = store.collection::<Person>().unwrap();

    let err = people
        .map_reduce::<Document>("function() {}", "function() {}", None)
        .await
        .unwrap_err();
    assert!(matches!(err, MapperError::Backend(_)));

    people.insert_one(&person("Gus", 50, &[])).await.unwrap();
    let err = people
        .find_one(DbQuery::where_js("this.age > 1"))
        .await
        .unwrap_err();
    assert!(matches!(err, MapperError::Backend(_)));
}

#[tokio::test]
async fn test_collection_administration() {
    let store = store();
    let people = store.collection::<Person>().unwrap();
    people.insert_one(&person("Hal", 60, &[])).await.unwrap();

    let index = people.create_index(doc! { "name": 1 }, false).await.unwrap();
    people.drop_index(&index).await.unwrap();

    store.create_collection("audit").await.unwrap();
    let mut names = store.list_collections().await.unwrap();
    names.sort();
    assert_eq!(names, vec!["audit".to_string(), "people".to_string()]);

    people.drop().await.unwrap();
    assert_eq!(store.list_collections().await.unwrap(), vec!["audit".to_string()]);

    assert!(matches!(store.shutdown().await, Err(MapperError::IllegalState(_))));
}

#[tokio::test]
async fn test_shutdown_after_collections_are_dropped() {
    let store = store();
    let people = store.collection::<Person>().unwrap();
    people.insert_one(&person("Ivy", 70, &[])).await.unwrap();
    drop(people);

    store.shutdown().await.unwrap();
}
