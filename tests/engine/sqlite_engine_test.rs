#[path = "../common/mod.rs"]
mod common;

use common::{engine, engine_with, ids, int, sorted_ids, text};
use graft::{EngineSettings, Filter, QueryError, Related, Value};

fn book_ids(instance: &graft::Instance, relation: &str) -> Vec<i64> {
    ids(instance.many(relation))
}

// =============================================================================
// Joins and merge
// =============================================================================

#[tokio::test]
async fn test_authors_with_books_are_merged() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .order_by(["id"])
        .all()
        .await
        .unwrap();

    assert_eq!(ids(&authors), vec![1, 2, 3]);
    assert_eq!(book_ids(&authors[0], "books"), vec![1, 2, 3]);
    assert_eq!(book_ids(&authors[1], "books"), vec![4, 5]);
    assert_eq!(book_ids(&authors[2], "books"), vec![6]);
    assert_eq!(text(&authors[0].many("books")[0], "title"), "Ash");
}

#[tokio::test]
async fn test_author_without_books_gets_empty_list() {
    let engine = engine();
    let publishers = engine
        .query("Publisher")
        .unwrap()
        .select_related(["authors"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&publishers), vec![1, 2]);

    let editors = engine
        .query("Author")
        .unwrap()
        .filter("id", 3)
        .select_related(["edited_books"])
        .all()
        .await
        .unwrap();
    assert!(editors[0].is_loaded("edited_books"));
    assert!(editors[0].many("edited_books").is_empty());
}

#[tokio::test]
async fn test_nested_fan_out_dedupes_every_level() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .filter("id", 1)
        .select_related(["books__tags"])
        .all()
        .await
        .unwrap();

    assert_eq!(authors.len(), 1);
    let books = authors[0].many("books");
    assert_eq!(ids(books), vec![1, 2, 3]);
    assert_eq!(ids(books[0].many("tags")), vec![1, 2]);
    assert_eq!(ids(books[1].many("tags")), vec![1]);
    assert!(books[2].many("tags").is_empty());
}

#[tokio::test]
async fn test_two_foreign_keys_to_same_target() {
    let engine = engine();
    let book = engine
        .query("Book")
        .unwrap()
        .filter("id", 1)
        .select_related(["author", "editor"])
        .get()
        .await
        .unwrap();

    assert_eq!(text(book.one("author").unwrap(), "name"), "Ann");
    assert_eq!(text(book.one("editor").unwrap(), "name"), "Ben");
}

#[tokio::test]
async fn test_missing_to_one_is_loaded_none() {
    let engine = engine();
    let book = engine
        .query("Book")
        .unwrap()
        .filter("id", 7)
        .select_related(["author"])
        .get()
        .await
        .unwrap();
    assert!(book.is_loaded("author"));
    assert!(book.one("author").is_none());
}

// =============================================================================
// Self reference
// =============================================================================

#[tokio::test]
async fn test_self_reference_chain() {
    let engine = engine();
    let low = engine
        .query("Employee")
        .unwrap()
        .filter("name", "Low")
        .select_related(["supervisor__supervisor"])
        .get()
        .await
        .unwrap();

    let mid = low.one("supervisor").unwrap();
    assert_eq!(text(mid, "name"), "Mid");
    let boss = mid.one("supervisor").unwrap();
    assert_eq!(text(boss, "name"), "Boss");
}

#[tokio::test]
async fn test_self_reference_reverse_tree() {
    let engine = engine();
    let boss = engine
        .query("Employee")
        .unwrap()
        .filter("id", 1)
        .select_related(["employees__employees"])
        .get()
        .await
        .unwrap();

    let direct = boss.many("employees");
    assert_eq!(ids(direct), vec![2]);
    assert_eq!(ids(direct[0].many("employees")), vec![3, 4]);
}

#[tokio::test]
async fn test_filter_through_self_reference() {
    let engine = engine();
    let reports = engine
        .query("Employee")
        .unwrap()
        .filter("supervisor__name", "Mid")
        .order_by(["id"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&reports), vec![3, 4]);
}

// =============================================================================
// Pagination under fan-out
// =============================================================================

async fn paginated(settings: EngineSettings) {
    let engine = engine_with(settings);
    let first_page = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .order_by(["id"])
        .limit(2)
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&first_page), vec![1, 2]);
    assert_eq!(book_ids(&first_page[0], "books"), vec![1, 2, 3]);
    assert_eq!(book_ids(&first_page[1], "books"), vec![4, 5]);

    let second_page = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .order_by(["id"])
        .paginate(2, 2)
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&second_page), vec![3]);
    assert_eq!(book_ids(&second_page[0], "books"), vec![6]);

    let descending = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .order_by(["-name"])
        .limit(1)
        .offset(1)
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&descending), vec![2]);
    assert_eq!(book_ids(&descending[0], "books"), vec![4, 5]);
}

#[tokio::test]
async fn test_pagination_counts_roots_with_derived_table() {
    paginated(EngineSettings::default()).await;
}

#[tokio::test]
async fn test_pagination_counts_roots_with_key_semi_join() {
    let mut settings = EngineSettings::default();
    settings.pagination.subquery = false;
    paginated(settings).await;
}

#[tokio::test]
async fn test_pagination_with_relation_filter() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .filter("books__title__startswith", "D")
        .select_related(["books"])
        .limit(5)
        .all()
        .await
        .unwrap();

    // Only Ben has a matching book; the joined books are filtered too.
    assert_eq!(ids(&authors), vec![2]);
    assert_eq!(book_ids(&authors[0], "books"), vec![4]);
}

#[tokio::test]
async fn test_limit_raw_sql_caps_joined_rows() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .order_by(["id"])
        .limit(2)
        .limit_raw_sql(true)
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&authors), vec![1]);
    assert_eq!(book_ids(&authors[0], "books"), vec![1, 2]);
}

async fn paginated_by_relation(settings: EngineSettings) {
    let engine = engine_with(settings);
    let by_author = |limit: u64, offset: u64| {
        engine
            .query("Book")
            .unwrap()
            .select_related(["author"])
            .filter("author__isnull", false)
            .order_by(["-author__name"])
            .limit(limit)
            .offset(offset)
    };

    let top = by_author(1, 0).all().await.unwrap();
    assert_eq!(ids(&top), vec![6]);
    assert_eq!(text(top[0].one("author").unwrap(), "name"), "Cat");
    assert_eq!(ids(&by_author(2, 1).all().await.unwrap()), vec![4, 5]);

    // To-many ordering: ascending pages by each author's smallest title.
    let ascending = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .order_by(["books__title"])
        .limit(1)
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&ascending), vec![2]);
    assert_eq!(book_ids(&ascending[0], "books"), vec![5, 4]);

    // Descending pages by each author's largest title.
    let descending = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .order_by(["-books__title"])
        .limit(2)
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&descending), vec![2, 1]);
    assert_eq!(book_ids(&descending[1], "books"), vec![3, 2, 1]);
}

#[tokio::test]
async fn test_pagination_by_relation_field_with_derived_table() {
    paginated_by_relation(EngineSettings::default()).await;
}

#[tokio::test]
async fn test_pagination_by_relation_field_with_key_semi_join() {
    let mut settings = EngineSettings::default();
    settings.pagination.subquery = false;
    paginated_by_relation(settings).await;
}

#[tokio::test]
async fn test_first_follows_relation_ordering() {
    let engine = engine();
    let book = engine
        .query("Book")
        .unwrap()
        .filter("author__isnull", false)
        .order_by(["-author__name"])
        .first()
        .await
        .unwrap();
    assert_eq!(int(&book, "id"), 6);

    let author = engine
        .query("Author")
        .unwrap()
        .order_by(["-books__title"])
        .first()
        .await
        .unwrap();
    assert_eq!(text(&author, "name"), "Ben");
}

// =============================================================================
// Lookups
// =============================================================================

#[tokio::test]
async fn test_like_wildcards_match_literally() {
    let engine = engine();
    let books = engine
        .query("Book")
        .unwrap()
        .filter("title__contains", "50%_off")
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&books), vec![5]);

    let books = engine
        .query("Book")
        .unwrap()
        .filter("title__istartswith", "50%_OF")
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&books), vec![5]);
}

#[tokio::test]
async fn test_case_insensitive_exact() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .filter("name__iexact", "ann")
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&authors), vec![1]);
}

#[tokio::test]
async fn test_null_lookups() {
    let engine = engine();
    let no_bio = engine
        .query("Author")
        .unwrap()
        .filter("bio", Value::Null)
        .all()
        .await
        .unwrap();
    assert_eq!(sorted_ids(&no_bio), vec![1, 3]);

    let with_bio = engine
        .query("Author")
        .unwrap()
        .filter("bio__isnull", false)
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&with_bio), vec![2]);
}

#[tokio::test]
async fn test_in_and_comparisons() {
    let engine = engine();
    let books = engine
        .query("Book")
        .unwrap()
        .filter("id__in", vec![2, 4, 6])
        .filter("id__gt", 2)
        .order_by(["id"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&books), vec![4, 6]);

    let none = engine
        .query("Book")
        .unwrap()
        .filter("id__in", Vec::<i64>::new())
        .all()
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_filter_by_instance() {
    let engine = engine();
    let ann = engine
        .query("Author")
        .unwrap()
        .filter("name", "Ann")
        .get()
        .await
        .unwrap();

    let books = engine
        .query("Book")
        .unwrap()
        .filter("author", ann)
        .order_by(["id"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&books), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_exclude_and_groups() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .exclude("name", "Ann")
        .order_by(["id"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&authors), vec![2, 3]);

    let authors = engine
        .query("Author")
        .unwrap()
        .filter_group(Filter::or(vec![
            Filter::lookup("name", "Cat"),
            Filter::lookup("books__title", "Dune"),
        ]))
        .order_by(["id"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&authors), vec![2, 3]);

    let authors = engine
        .query("Author")
        .unwrap()
        .filter_group(!Filter::and(vec![
            Filter::lookup("id__gte", 2),
            Filter::lookup("bio__isnull", true),
        ]))
        .order_by(["id"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&authors), vec![1, 2]);
}

#[tokio::test]
async fn test_order_by_relation_field() {
    let engine = engine();
    let books = engine
        .query("Book")
        .unwrap()
        .filter("author__isnull", false)
        .order_by(["-author__name", "title"])
        .all()
        .await
        .unwrap();
    assert_eq!(ids(&books), vec![6, 5, 4, 1, 2, 3]);
}

// =============================================================================
// Projection
// =============================================================================

#[tokio::test]
async fn test_fields_and_exclude_fields() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .filter("id", 2)
        .fields(vec!["id", "name"])
        .all()
        .await
        .unwrap();
    assert_eq!(authors[0].get("bio"), Some(&Value::Null));
    assert_eq!(text(&authors[0], "name"), "Ben");

    let authors = engine
        .query("Author")
        .unwrap()
        .filter("id", 2)
        .select_related(["books"])
        .exclude_fields(vec!["bio", "books__editor_id"])
        .all()
        .await
        .unwrap();
    assert_eq!(authors[0].get("bio"), Some(&Value::Null));
    let dune = &authors[0].many("books")[0];
    assert_eq!(dune.get("editor_id"), Some(&Value::Null));
    assert_eq!(text(dune, "title"), "Dune");
}

#[tokio::test]
async fn test_excluding_required_field_fails_before_execution() {
    let engine = engine();
    let err = engine
        .query("Author")
        .unwrap()
        .exclude_fields("name")
        .all()
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::ExcludedRequiredField { ref field, .. } if field == "name"));

    let err = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .fields(vec!["id", "name", "books__id"])
        .compile()
        .unwrap_err();
    assert!(matches!(err, QueryError::ExcludedRequiredField { ref field, .. } if field == "title"));
}

#[tokio::test]
async fn test_excluded_relation_is_not_joined() {
    let engine = engine();
    let authors = engine
        .query("Author")
        .unwrap()
        .select_related(["books"])
        .exclude_fields("books")
        .all()
        .await
        .unwrap();
    assert_eq!(authors.len(), 3);
    assert!(authors.iter().all(|a| !a.is_loaded("books")));
}

#[tokio::test]
async fn test_foreign_key_stub() {
    let engine = engine();
    let books = engine
        .query("Book")
        .unwrap()
        .filter("id__in", vec![1, 7])
        .order_by(["id"])
        .all()
        .await
        .unwrap();

    let stub = books[0].one("author").unwrap();
    assert_eq!(int(stub, "id"), 1);
    assert_eq!(stub.get("name"), None);
    assert!(matches!(books[1].related("author"), Some(Related::One(None))));
}

// =============================================================================
// Entry points
// =============================================================================

#[tokio::test]
async fn test_single_row_entry_points() {
    let engine = engine();
    let authors = engine.query("Author").unwrap();

    let err = authors.clone().filter("name", "Nobody").get().await.unwrap_err();
    assert!(matches!(err, QueryError::NoMatchingRows { .. }));

    let err = authors.clone().get().await.unwrap_err();
    assert!(matches!(err, QueryError::MultipleMatchingRows { count: 3, .. }));

    assert!(authors
        .clone()
        .filter("name", "Nobody")
        .get_or_none()
        .await
        .unwrap()
        .is_none());

    let first = authors.clone().first().await.unwrap();
    assert_eq!(int(&first, "id"), 1);

    let last = authors.clone().order_by(["-id"]).first().await.unwrap();
    assert_eq!(int(&last, "id"), 3);
}

#[tokio::test]
async fn test_count_and_exists() {
    let engine = engine();
    let authors = engine.query("Author").unwrap();

    assert_eq!(authors.clone().count().await.unwrap(), 3);
    assert_eq!(
        authors
            .clone()
            .filter("books__title__startswith", "A")
            .count()
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        authors
            .clone()
            .select_related(["books"])
            .limit(1)
            .count()
            .await
            .unwrap(),
        3
    );
    assert!(!authors.clone().filter("id", 99).exists().await.unwrap());
}

#[tokio::test]
async fn test_unknown_relation_fails_before_execution() {
    let engine = engine();
    let err = engine
        .query("Author")
        .unwrap()
        .select_related(["books__nope"])
        .all()
        .await
        .unwrap_err();
    match err {
        QueryError::UnknownRelation { path, segment } => {
            assert_eq!(path, "books__nope");
            assert_eq!(segment, "nope");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(matches!(
        engine.query("Nope"),
        Err(QueryError::Schema(_))
    ));
}

#[tokio::test]
async fn test_instances_serialize() {
    let engine = engine();
    let book = engine
        .query("Book")
        .unwrap()
        .filter("id", 4)
        .select_related(["author"])
        .fields(vec!["id", "title", "author_id", "author__id", "author__name"])
        .get()
        .await
        .unwrap();

    let json = book.to_json().unwrap();
    assert_eq!(json["title"], "Dune");
    assert_eq!(json["author"]["name"], "Ben");
    assert_eq!(json["author"]["bio"], serde_json::Value::Null);
}
