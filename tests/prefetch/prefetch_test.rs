#[path = "../common/mod.rs"]
mod common;

use common::{backend, engine, engine_with, ids, int, library_schema, text};
use graft::prefetch::NodeState;
use graft::{Engine, EngineSettings, Instance, QueryError};

fn by_id(instances: &[Instance], id: i64) -> &Instance {
    instances
        .iter()
        .find(|i| int(i, "id") == id)
        .unwrap_or_else(|| panic!("no instance with id {id}"))
}

#[tokio::test]
async fn test_reverse_foreign_key_prefetch() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .prefetch_related(["books"])
        .all()
        .await
        .unwrap();

    assert_eq!(ids(&authors), vec![1, 2, 3]);
    assert_eq!(ids(authors[0].many("books")), vec![1, 2, 3]);
    assert_eq!(ids(authors[1].many("books")), vec![4, 5]);
    assert_eq!(ids(authors[2].many("books")), vec![6]);
}

#[tokio::test]
async fn test_empty_prefetch_is_loaded() {
    let engine = engine();
    let publishers = engine
        .query("Publisher")
        .unwrap()
        .filter("id", 2)
        .prefetch_related(["authors__books"])
        .all()
        .await
        .unwrap();
    let ben = &publishers[0].many("authors")[0];
    assert_eq!(ids(ben.many("books")), vec![4, 5]);

    let cat = engine
        .query("Author")
        .unwrap()
        .filter("id", 3)
        .prefetch_related(["edited_books"])
        .get()
        .await
        .unwrap();
    assert!(cat.is_loaded("edited_books"));
    assert!(cat.many("edited_books").is_empty());
}

async fn siblings(settings: EngineSettings) -> Vec<Instance> {
    engine_with(settings)
        .query("Author")
        .unwrap()
        .prefetch_related(["books", "edited_books"])
        .all()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sibling_prefetch_sequential_matches_concurrent() {
    let concurrent = siblings(EngineSettings::default()).await;
    let mut settings = EngineSettings::default();
    settings.prefetch.concurrent_siblings = false;
    let sequential = siblings(settings).await;

    assert_eq!(concurrent, sequential);
    assert_eq!(ids(concurrent[0].many("edited_books")), vec![4]);
    assert_eq!(ids(concurrent[1].many("edited_books")), vec![1]);
    assert_eq!(ids(concurrent[0].many("books")), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_nested_prefetch() {
    let engine = engine();
    let publishers = engine
        .query("Publisher")
        .unwrap()
        .prefetch_related(["authors__books"])
        .all()
        .await
        .unwrap();

    assert_eq!(ids(&publishers), vec![1, 2]);
    let orbit = publishers[0].many("authors");
    assert_eq!(ids(orbit), vec![1]);
    assert_eq!(ids(orbit[0].many("books")), vec![1, 2, 3]);
    let tor = publishers[1].many("authors");
    assert_eq!(ids(tor), vec![2]);
    assert_eq!(ids(tor[0].many("books")), vec![4, 5]);
}

#[tokio::test]
async fn test_foreign_key_prefetch() {
    let engine = engine();
    let books = engine
        .query("Book")
        .unwrap()
        .prefetch_related(["author"])
        .all()
        .await
        .unwrap();

    assert_eq!(books.len(), 7);
    let ash = by_id(&books, 1);
    assert_eq!(text(ash.one("author").unwrap(), "name"), "Ann");
    let dune = by_id(&books, 4);
    assert_eq!(text(dune.one("author").unwrap(), "name"), "Ben");

    let orphan = by_id(&books, 7);
    assert!(orphan.is_loaded("author"));
    assert!(orphan.one("author").is_none());
}

#[tokio::test]
async fn test_many_to_many_prefetch() {
    let engine = engine();
    let books = engine
        .query("Book")
        .unwrap()
        .prefetch_related(["tags"])
        .all()
        .await
        .unwrap();

    let ash = by_id(&books, 1);
    assert_eq!(ids(ash.many("tags")), vec![1, 2]);
    assert_eq!(ids(by_id(&books, 2).many("tags")), vec![1]);
    assert!(by_id(&books, 3).many("tags").is_empty());
    // The owner link used for grouping is not left on the tags.
    assert!(!ash.many("tags")[0].is_loaded("books"));
    assert_eq!(text(&ash.many("tags")[1], "name"), "fantasy");
}

#[tokio::test]
async fn test_many_to_many_prefetch_from_target_side() {
    let engine = engine();
    let tags = engine
        .query("Tag")
        .unwrap()
        .prefetch_related(["books"])
        .all()
        .await
        .unwrap();

    assert_eq!(ids(tags[0].many("books")), vec![1, 2]);
    assert_eq!(ids(tags[1].many("books")), vec![1, 4]);
    assert_eq!(text(&tags[1].many("books")[1], "title"), "Dune");
}

#[tokio::test]
async fn test_prefetch_below_joined_relation() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .prefetch_related(["books__tags"])
        .all()
        .await
        .unwrap();

    let ann = by_id(&authors, 1);
    let books = ann.many("books");
    assert_eq!(ids(books), vec![1, 2, 3]);
    assert_eq!(ids(books[0].many("tags")), vec![1, 2]);
    assert_eq!(ids(books[1].many("tags")), vec![1]);
    assert!(books[2].is_loaded("tags"));
    assert!(books[2].many("tags").is_empty());

    let ben = by_id(&authors, 2);
    assert_eq!(ids(ben.many("books")[0].many("tags")), vec![2]);
}

#[tokio::test]
async fn test_prefetch_ordering() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .prefetch_related(["books"])
        .order_by(["-name", "-books__title"])
        .all()
        .await
        .unwrap();

    assert_eq!(ids(&authors), vec![3, 2, 1]);
    let ann = by_id(&authors, 1);
    let titles: Vec<String> = ann.many("books").iter().map(|b| text(b, "title")).collect();
    assert_eq!(titles, vec!["Cedar", "Birch", "Ash"]);
}

#[tokio::test]
async fn test_prefetch_respects_projection() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .prefetch_related(["books", "edited_books"])
        .exclude_fields(vec!["books__editor_id", "edited_books"])
        .all()
        .await
        .unwrap();

    let ann = by_id(&authors, 1);
    assert!(!ann.is_loaded("edited_books"));
    let ash = &ann.many("books")[0];
    assert!(ash.get("editor_id").map_or(true, |v| v.is_null()));
    assert_eq!(text(ash, "title"), "Ash");
}

#[tokio::test]
async fn test_prefetch_with_root_limit() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .prefetch_related(["books"])
        .limit(1)
        .all()
        .await
        .unwrap();

    assert_eq!(ids(&authors), vec![1]);
    assert_eq!(ids(authors[0].many("books")), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_compile_reports_prefetch_plan() {
    let engine = engine();
    let compiled = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .prefetch_related(["books__tags", "edited_books"])
        .order_by(["-edited_books__title"])
        .compile()
        .unwrap();

    let steps: Vec<(&str, &str, NodeState)> = compiled
        .prefetch
        .iter()
        .map(|s| (s.path.as_str(), s.relation.as_str(), s.state))
        .collect();
    assert_eq!(
        steps,
        vec![
            ("books", "Author.books", NodeState::AlreadyLoaded),
            ("books__tags", "Book.tags", NodeState::Pending),
            ("edited_books", "Author.edited_books", NodeState::Pending),
        ]
    );
    assert_eq!(compiled.prefetch[2].order_by, vec!["-title".to_string()]);
    // The relation ordering moved to the follow-up statement.
    assert!(!compiled.sql.contains("DESC"));

    let json = serde_json::to_value(&compiled).unwrap();
    assert_eq!(json["prefetch"][0]["state"], "already_loaded");
}

#[tokio::test]
async fn test_unknown_prefetch_path_fails_before_execution() {
    let engine = engine();
    let result = engine
        .query("Author")
        .unwrap()
        .prefetch_related(["books__nope"])
        .all()
        .await;
    assert!(matches!(
        result,
        Err(QueryError::UnknownRelation { ref segment, .. }) if segment == "nope"
    ));
}

#[tokio::test]
async fn test_failed_follow_up_statement_surfaces_error() {
    let backend = backend();
    backend.execute_batch("DROP TABLE book_tags;").unwrap();
    let engine = Engine::new(library_schema(), backend);

    let result = engine
        .query("Book")
        .unwrap()
        .prefetch_related(["tags"])
        .all()
        .await;
    assert!(matches!(result, Err(QueryError::Backend(_))));

    // The main statement alone still works.
    let books = engine.query("Book").unwrap().all().await.unwrap();
    assert_eq!(books.len(), 7);
}
