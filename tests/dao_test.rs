//! Integration tests for the DAO against SQLite.

mod common;

use ambient_db::db::{Dao, Join, QueryOption};
use ambient_db::error::DbError;
use common::{JoinedTableForTest, KeywordTableForTest, TableForTest, setup, test_table};

#[tokio::test]
async fn test_add_assigns_generated_ids() {
    let (manager, _dir) = setup().await;

    let (first, rest) = manager
        .transactional(|| async {
            let dao = Dao::new();
            let first = dao.add(&TableForTest::new("first", Some(1))).await?;
            let rest = dao
                .add_all(&[
                    TableForTest::new("second", Some(2)),
                    TableForTest::new("third", None),
                ])
                .await?;
            Ok::<_, DbError>((first, rest))
        })
        .await
        .unwrap();

    assert_eq!(first.id, Some(1));
    assert_eq!(first.name, "first");
    let ids: Vec<_> = rest.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![Some(2), Some(3)]);
    assert_eq!(rest[1].value, None);

    let loaded = manager
        .with_session(|| async {
            let dao = Dao::new();
            let found = dao.get::<TableForTest>(2).await?;
            let missing = dao.get::<TableForTest>(42).await?;
            Ok::<_, DbError>((found, missing))
        })
        .await
        .unwrap();
    assert_eq!(loaded.0.map(|t| t.name), Some("second".to_string()));
    assert!(loaded.1.is_none());
}

#[tokio::test]
async fn test_get_by_ids_preserves_order() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let dao = Dao::new();
            dao.add(&TableForTest::with_id(1001, "b")).await?;
            dao.add(&TableForTest::with_id(1000, "a")).await?;

            let ordered = dao
                .get_by_ids(TableForTest::id(), &[1000, 1001, 1002], true)
                .await?;
            let ids: Vec<_> = ordered.iter().map(|t| t.id).collect();
            assert_eq!(ids, vec![Some(1000), Some(1001)]);

            let reversed = dao
                .get_by_ids(TableForTest::id(), &[1002, 1001, 1000], true)
                .await?;
            let ids: Vec<_> = reversed.iter().map(|t| t.id).collect();
            assert_eq!(ids, vec![Some(1001), Some(1000)]);

            let repeated = dao
                .get_by_ids(TableForTest::id(), &[1000, 1001, 1000], true)
                .await?;
            let ids: Vec<_> = repeated.iter().map(|t| t.id).collect();
            assert_eq!(ids, vec![Some(1000), Some(1001), Some(1000)]);

            let unordered = dao
                .get_by_ids(TableForTest::id(), &[1000, 1001, 1002], false)
                .await?;
            assert_eq!(unordered.len(), 2);

            let none = dao.get_by_ids(TableForTest::id(), &[], true).await?;
            assert!(none.is_empty());
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_map_by_ids_last_write_wins() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let mut dao = Dao::new();
            dao.add_all(&[
                TableForTest::new("same", Some(1)),
                TableForTest::new("same", Some(2)),
                TableForTest::new("other", Some(1)),
            ])
            .await?;
            dao.order_by(TableForTest::id().asc());

            let by_name = dao
                .get_map_by_ids(TableForTest::id(), &[1, 2, 3], TableForTest::name())
                .await?;
            assert_eq!(by_name.len(), 2);
            assert_eq!(by_name["same"].id, Some(2));
            assert_eq!(by_name["other"].id, Some(3));

            let by_id = dao
                .get_map_by_ids(TableForTest::id(), &[1, 3], TableForTest::id())
                .await?;
            assert_eq!(by_id.len(), 2);
            assert_eq!(by_id[&3].name, "other");

            let grouped = dao
                .get_grouped_by_ids(TableForTest::id(), &[1, 2, 3], TableForTest::value())
                .await?;
            let ones: Vec<_> = grouped[&Some(1)].iter().map(|t| t.id).collect();
            assert_eq!(ones, vec![Some(1), Some(3)]);
            assert_eq!(grouped[&Some(2)].len(), 1);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_first_shapes_results() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let dao = Dao::new();

            let (name, value) = dao
                .get_first(&dao.select((TableForTest::name(), TableForTest::value())))
                .await?;
            assert_eq!(name, None);
            assert_eq!(value, None);

            let single = dao.get_first(&dao.select(TableForTest::name())).await?;
            assert_eq!(single, None);

            dao.add(&TableForTest::new("only", Some(7))).await?;

            let (name, value) = dao
                .get_first(&dao.select((TableForTest::name(), TableForTest::value())))
                .await?;
            assert_eq!(name.as_deref(), Some("only"));
            assert_eq!(value, Some(Some(7)));

            let entity = dao.get_first(&dao.select(test_table())).await?;
            assert_eq!(entity.map(|t| t.value), Some(Some(7)));
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_all_unwraps_single_column() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let mut dao = Dao::new();
            dao.add_all(&[
                TableForTest::new("x", Some(1)),
                TableForTest::new("y", None),
                TableForTest::new("z", Some(3)),
            ])
            .await?;

            dao.filter(TableForTest::value().is_not_null())
                .order_by(TableForTest::name().desc());

            let names: Vec<String> = dao.get_all(&dao.select(TableForTest::name())).await?;
            assert_eq!(names, vec!["z".to_string(), "x".to_string()]);

            let pairs = dao
                .get_all(&dao.select((TableForTest::id(), TableForTest::name())))
                .await?;
            assert_eq!(pairs, vec![(3, "z".to_string()), (1, "x".to_string())]);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_fan_out_join_is_deduplicated() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let dao = Dao::new();
            let parent = dao.add(&TableForTest::new("parent", None)).await?;
            let parent_id = parent.id.unwrap_or_default();
            dao.add_all(&[
                JoinedTableForTest::new(parent_id, "a"),
                JoinedTableForTest::new(parent_id, "b"),
                JoinedTableForTest::new(parent_id, "c"),
            ])
            .await?;

            let on = JoinedTableForTest::parent_id().eq_column(&TableForTest::id());

            let mut fan_out = Dao::new();
            fan_out.options([Join::left::<JoinedTableForTest>(on.clone()).one_to_many()]);
            let parents = fan_out.get_all(&fan_out.select(test_table())).await?;
            assert_eq!(parents.len(), 1);
            assert_eq!(parents[0].name, "parent");

            let mut plain = Dao::new();
            plain.options([QueryOption::from(Join::left::<JoinedTableForTest>(on))]);
            let rows = plain.get_all(&plain.select(test_table())).await?;
            assert_eq!(rows.len(), 3);

            let labels = fan_out
                .get_all(
                    &fan_out
                        .select((test_table(), JoinedTableForTest::label()))
                        .filter(JoinedTableForTest::label().ne("b")),
                )
                .await?;
            assert_eq!(labels.len(), 2);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_and_delete_report_row_counts() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let dao = Dao::new();
            dao.add_all(&[
                TableForTest::new("keep", Some(1)),
                TableForTest::new("drop", Some(2)),
                TableForTest::new("drop", Some(3)),
            ])
            .await?;

            let mut dropping = Dao::new();
            dropping.filter(TableForTest::name().eq("drop"));

            let updated = dropping
                .get_rows_count(&dropping.update::<TableForTest>().set(TableForTest::value(), 10))
                .await?;
            assert_eq!(updated, 2);

            let deleted = dropping
                .get_rows_count(&dropping.delete::<TableForTest>())
                .await?;
            assert_eq!(deleted, 2);

            let remaining = dao.get_all(&dao.select(TableForTest::name())).await?;
            assert_eq!(remaining, vec!["keep".to_string()]);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_keyword_table_and_column_names() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let dao = Dao::new();
            let stored = dao.add(&KeywordTableForTest::new("a")).await?;
            dao.add(&KeywordTableForTest::new("b")).await?;
            assert_eq!(stored.id, Some(1));
            assert_eq!(stored.group, "a");

            let mut by_group = Dao::new();
            by_group.filter(KeywordTableForTest::group().eq("a"));
            let updated = by_group
                .get_rows_count(
                    &by_group
                        .update::<KeywordTableForTest>()
                        .set(KeywordTableForTest::group(), "c"),
                )
                .await?;
            assert_eq!(updated, 1);

            let mut ordered = Dao::new();
            ordered.order_by(KeywordTableForTest::group().desc());
            let groups: Vec<String> = ordered
                .get_all(&ordered.select(KeywordTableForTest::group()))
                .await?;
            assert_eq!(groups, vec!["c".to_string(), "b".to_string()]);

            let reloaded = dao.get::<KeywordTableForTest>(1).await?;
            assert_eq!(reloaded.map(|t| t.group), Some("c".to_string()));
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dao_outside_scope_fails_with_missing_session() {
    let (manager, _dir) = setup().await;
    let dao = Dao::new();

    let err = dao.get_all(&dao.select(test_table())).await.unwrap_err();
    assert!(err.is_missing_session());

    let err = dao
        .add(&TableForTest::new("nope", None))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::MissingSession { .. }));

    // Built outside, used inside
    let found = manager
        .with_session(|| async { dao.get_all(&dao.select(test_table())).await })
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn test_explicit_session_is_used_directly() {
    let (manager, _dir) = setup().await;

    manager
        .transactional(|| async {
            let session = ambient_db::db::current_session()?;
            let dao = Dao::with_session(session);
            let stored = dao.add(&TableForTest::new("pinned", None)).await?;
            assert_eq!(
                dao.get::<TableForTest>(stored.id.unwrap_or_default())
                    .await?
                    .map(|t| t.name),
                Some("pinned".to_string())
            );
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
}
