#[path = "../common/mod.rs"]
mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{ids, int, library_schema};
use graft::alias::AliasRegistry;
use graft::config::EngineSettings;
use graft::materialize::{MergeEngine, RowMaterializer};
use graft::planner::{JoinPlanner, JoinTree, QueryRequest};
use graft::schema::EntityType;
use graft::{
    ConstructError, DefaultFactory, EntityId, Instance, InstanceFactory, QueryError, Related,
    RelationPath, ResultRow, Schema, Value,
};

const BOOKS: &str = "73e911";

fn author_books_tree(schema: &Schema) -> JoinTree {
    let registry = AliasRegistry::default();
    let settings = EngineSettings::default();
    let mut req = QueryRequest::new(schema.entity_id("Author").unwrap());
    req.select_related = vec![RelationPath::parse("books")];
    JoinPlanner::new(schema, &registry, &settings)
        .plan(&req)
        .unwrap()
        .tree
}

fn row(author: (i64, &str), book: Option<(i64, &str)>) -> ResultRow {
    let mut row = ResultRow::new();
    row.insert("id".into(), Value::Int(author.0));
    row.insert("name".into(), Value::from(author.1));
    row.insert("bio".into(), Value::Null);
    row.insert("publisher_id".into(), Value::Null);
    let (book_id, title) = match book {
        Some((id, title)) => (Value::Int(id), Value::from(title)),
        None => (Value::Null, Value::Null),
    };
    row.insert(format!("{BOOKS}_id"), book_id);
    row.insert(format!("{BOOKS}_title"), title);
    row.insert(format!("{BOOKS}_author_id"), Value::Int(author.0));
    row.insert(format!("{BOOKS}_editor_id"), Value::Null);
    row
}

#[test]
fn test_rows_to_merged_tree() {
    let schema = library_schema();
    let tree = author_books_tree(&schema);
    let rows = vec![
        row((1, "Ann"), Some((1, "Ash"))),
        row((1, "Ann"), Some((2, "Birch"))),
        row((2, "Ben"), Some((4, "Dune"))),
        row((1, "Ann"), Some((3, "Cedar"))),
        row((3, "Cat"), None),
    ];

    let materializer = RowMaterializer::new(&schema, &DefaultFactory);
    let flat = materializer.materialize(&rows, &tree).unwrap();
    assert_eq!(flat.len(), 5);

    let merged = MergeEngine::new(&schema).merge(flat);
    assert_eq!(ids(&merged), vec![1, 2, 3]);
    assert_eq!(ids(merged[0].many("books")), vec![1, 2, 3]);
    assert_eq!(ids(merged[1].many("books")), vec![4]);
    assert!(merged[2].is_loaded("books"));
    assert!(merged[2].many("books").is_empty());
}

#[test]
fn test_row_without_root_key_is_skipped() {
    let schema = library_schema();
    let tree = author_books_tree(&schema);
    let mut orphan = row((9, "Ghost"), None);
    orphan.insert("id".into(), Value::Null);

    let materializer = RowMaterializer::new(&schema, &DefaultFactory);
    assert!(materializer.from_row(&orphan, &tree).unwrap().is_none());
}

#[test]
fn test_missing_required_value_fails_construction() {
    let schema = library_schema();
    let tree = author_books_tree(&schema);
    let mut bad = row((1, "Ann"), Some((1, "Ash")));
    bad.insert(format!("{BOOKS}_title"), Value::Null);

    let materializer = RowMaterializer::new(&schema, &DefaultFactory);
    match materializer.materialize(&[bad], &tree) {
        Err(QueryError::Construct(ConstructError::MissingField { entity, field })) => {
            assert_eq!(entity, "Book");
            assert_eq!(field, "title");
        }
        other => panic!("expected construction failure, got {:?}", other.map(|v| v.len())),
    }
}

/// Counts constructions and tags each instance with its entity name.
#[derive(Default)]
struct TaggingFactory {
    built: AtomicUsize,
}

impl InstanceFactory for TaggingFactory {
    fn construct(
        &self,
        entity: &EntityType,
        id: EntityId,
        mut values: BTreeMap<String, Value>,
        _skip_validation: bool,
    ) -> Result<Instance, ConstructError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        values.insert("kind".into(), Value::from(entity.name.as_str()));
        Ok(Instance::new(id, values))
    }
}

#[test]
fn test_custom_factory_builds_every_instance() {
    let schema = library_schema();
    let tree = author_books_tree(&schema);
    let factory = TaggingFactory::default();
    let rows = vec![
        row((1, "Ann"), Some((1, "Ash"))),
        row((1, "Ann"), Some((2, "Birch"))),
    ];

    let flat = RowMaterializer::new(&schema, &factory)
        .materialize(&rows, &tree)
        .unwrap();
    // Per row: the author, the book, and the book's author stub.
    assert_eq!(factory.built.load(Ordering::SeqCst), 6);

    let merged = MergeEngine::new(&schema).merge(flat);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].get("kind"), Some(&Value::from("Author")));
    assert_eq!(merged[0].many("books")[1].get("kind"), Some(&Value::from("Book")));
}

fn instance(schema: &Schema, entity: &str, id: i64) -> Instance {
    let mut fields = BTreeMap::new();
    fields.insert("id".to_string(), Value::Int(id));
    Instance::new(schema.entity_id(entity).unwrap(), fields)
}

fn book_with_tags(schema: &Schema, id: i64, tags: &[i64]) -> Instance {
    let mut book = instance(schema, "Book", id);
    let tags = tags.iter().map(|t| instance(schema, "Tag", *t)).collect();
    book.set_related("tags", Related::Many(tags));
    book
}

#[test]
fn test_nested_collections_are_unioned() {
    let schema = library_schema();
    let mut rows = Vec::new();
    for (book, tag) in [(1, 1), (1, 2), (2, 1), (1, 1)] {
        let mut author = instance(&schema, "Author", 1);
        author.set_related("books", Related::Many(vec![book_with_tags(&schema, book, &[tag])]));
        rows.push(author);
    }

    let merged = MergeEngine::new(&schema).merge(rows);
    assert_eq!(merged.len(), 1);
    let books = merged[0].many("books");
    assert_eq!(ids(books), vec![1, 2]);
    assert_eq!(ids(books[0].many("tags")), vec![1, 2]);
    assert_eq!(ids(books[1].many("tags")), vec![1]);
}

#[test]
fn test_to_one_relations_merge_in_place() {
    let schema = library_schema();

    let mut first = instance(&schema, "Book", 1);
    let mut author = instance(&schema, "Author", 1);
    author.set_related("publisher", Related::One(None));
    first.set_related("author", Related::One(Some(Box::new(author))));

    let mut second = instance(&schema, "Book", 1);
    let mut author = instance(&schema, "Author", 1);
    author.set_related(
        "publisher",
        Related::One(Some(Box::new(instance(&schema, "Publisher", 2)))),
    );
    second.set_related("author", Related::One(Some(Box::new(author))));

    let merged = MergeEngine::new(&schema).merge(vec![first, second]);
    assert_eq!(merged.len(), 1);
    let author = merged[0].one("author").unwrap();
    assert_eq!(int(author, "id"), 1);
    assert_eq!(int(author.one("publisher").unwrap(), "id"), 2);
}

#[test]
fn test_null_fields_filled_from_later_rows() {
    let schema = library_schema();
    let author = schema.entity_id("Author").unwrap();
    let with_bio = |bio: Value| {
        let mut fields = BTreeMap::new();
        fields.insert("id".to_string(), Value::Int(1));
        fields.insert("bio".to_string(), bio);
        Instance::new(author, fields)
    };

    let merged = MergeEngine::new(&schema).merge(vec![
        with_bio(Value::Null),
        with_bio(Value::from("writes")),
        with_bio(Value::from("ignored")),
    ]);
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].get("bio"), Some(&Value::from("writes")));
}

/// Every permutation of `items`, in no particular order.
fn permutations<T: Clone>(items: &[T]) -> Vec<Vec<T>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for i in 0..items.len() {
        let mut rest = items.to_vec();
        let head = rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, head.clone());
            out.push(tail);
        }
    }
    out
}

/// Primary-key paths of every author, book and tag in the tree.
fn key_paths(authors: &[Instance]) -> BTreeSet<Vec<i64>> {
    let mut out = BTreeSet::new();
    for author in authors {
        let a = int(author, "id");
        out.insert(vec![a]);
        for book in author.many("books") {
            let b = int(book, "id");
            out.insert(vec![a, b]);
            for tag in book.many("tags") {
                out.insert(vec![a, b, int(tag, "id")]);
            }
        }
    }
    out
}

/// One joined row: an author carrying a single book and that book's tags.
fn fan_out(schema: &Schema, author: i64, book: i64, tags: &[i64]) -> Instance {
    let mut row = instance(schema, "Author", author);
    row.set_related(
        "books",
        Related::Many(vec![book_with_tags(schema, book, tags)]),
    );
    row
}

#[test]
fn test_merge_is_order_independent_and_idempotent() {
    let schema = library_schema();
    let rows = vec![
        fan_out(&schema, 1, 1, &[1]),
        fan_out(&schema, 1, 1, &[2]),
        fan_out(&schema, 1, 2, &[1]),
        fan_out(&schema, 2, 4, &[2]),
        fan_out(&schema, 1, 3, &[]),
        fan_out(&schema, 2, 5, &[1]),
    ];
    let expected: BTreeSet<Vec<i64>> = [
        vec![1],
        vec![1, 1],
        vec![1, 1, 1],
        vec![1, 1, 2],
        vec![1, 2],
        vec![1, 2, 1],
        vec![1, 3],
        vec![2],
        vec![2, 4],
        vec![2, 4, 2],
        vec![2, 5],
        vec![2, 5, 1],
    ]
    .into_iter()
    .collect();

    let engine = MergeEngine::new(&schema);
    let orders = permutations(&rows);
    assert_eq!(orders.len(), 720);
    for order in orders {
        let merged = engine.merge(order);
        assert_eq!(merged.len(), 2);
        assert_eq!(key_paths(&merged), expected);
        for author in &merged {
            let books = ids(author.many("books"));
            let unique: BTreeSet<_> = books.iter().collect();
            assert_eq!(unique.len(), books.len(), "duplicate child in {books:?}");
        }
        assert_eq!(engine.merge(merged.clone()), merged);
    }
}
