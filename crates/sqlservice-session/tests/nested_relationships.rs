mod common;

use asupersync::Cx;
use asupersync::runtime::RuntimeBuilder;
use common::{database, posts, unwrap_outcome, user_about, users};
use serde_json::json;
use sqlservice_core::{Instance, Record, Related, Value};
use sqlservice_session::{SaveOptions, Session};

#[test]
fn one_to_one_child_receives_parent_key() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let user = unwrap_outcome(
            session
                .save(
                    &cx,
                    (users(), json!({"name": "Ada", "about": {"bio": "Mathematician"}})),
                    &mut SaveOptions::default(),
                )
                .await,
        );
        let about = user.related_one("about").expect("about is attached");
        assert_eq!(user.get("id"), Value::BigInt(1));
        assert_eq!(about.get("user_id"), user.get("id"));
        assert_eq!(about.get("id"), Value::BigInt(1));
        assert!(session.contains(&about));
    });

    let statements = conn.statements();
    let user_insert = statements
        .iter()
        .position(|s| s.starts_with(r#"INSERT INTO "users""#))
        .expect("user inserted");
    let about_insert = statements
        .iter()
        .position(|s| s.starts_with(r#"INSERT INTO "user_about""#))
        .expect("about inserted");
    assert!(user_insert < about_insert);
    let row = conn.find("user_about", "id", 1_i64).expect("about row");
    assert_eq!(row.get("user_id"), Some(&Value::BigInt(1)));
    assert_eq!(conn.stats().commits, 1);
}

#[test]
fn one_to_many_children_replace_the_collection() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let user = unwrap_outcome(
            session
                .save(
                    &cx,
                    (
                        users(),
                        json!({"name": "Ada", "posts": [{"title": "Notes"}, {"title": "Sketches"}]}),
                    ),
                    &mut SaveOptions::default(),
                )
                .await,
        );
        let children = user.related_many("posts");
        assert_eq!(children.len(), 2);
        for post in &children {
            assert_eq!(post.get("user_id"), Value::BigInt(1));
        }
        assert_eq!(children[1].get("title"), Value::from("Sketches"));

        // Saving a new list replaces the attribute; the old post stays stored.
        let replaced = unwrap_outcome(
            session
                .save(
                    &cx,
                    (users(), json!({"id": 1, "posts": [{"title": "Letters"}]})),
                    &mut SaveOptions::default(),
                )
                .await,
        );
        assert!(replaced.ptr_eq(&user));
        let titles: Vec<Value> = user
            .related_many("posts")
            .iter()
            .map(|p| p.get("title"))
            .collect();
        assert_eq!(titles, vec![Value::from("Letters")]);
    });
    assert_eq!(conn.row_count("posts"), 3);
    assert_eq!(conn.stats().deletes, 0);
}

#[test]
fn many_to_one_target_is_saved_first() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let post = unwrap_outcome(
            session
                .save(
                    &cx,
                    (posts(), json!({"title": "Hello", "author": {"name": "Bob"}})),
                    &mut SaveOptions::default(),
                )
                .await,
        );
        let author = post.related_one("author").expect("author attached");
        assert_eq!(author.get("id"), Value::BigInt(1));
        assert_eq!(post.get("user_id"), Value::BigInt(1));
    });

    let inserts: Vec<String> = conn
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("INSERT"))
        .collect();
    assert_eq!(inserts.len(), 2);
    assert!(inserts[0].starts_with(r#"INSERT INTO "users""#));
    assert!(inserts[1].starts_with(r#"INSERT INTO "posts""#));
}

#[test]
fn many_to_one_existing_target_is_merged_not_inserted() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    conn.seed("users", &json!([{"id": 7, "name": "Bob", "email": "bob@example.com"}]))
        .expect("seed users");
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let post = unwrap_outcome(
            session
                .save(
                    &cx,
                    (posts(), json!({"title": "Hi", "author": {"id": 7}})),
                    &mut SaveOptions::default(),
                )
                .await,
        );
        assert_eq!(post.get("user_id"), Value::BigInt(7));
        let author = post.related_one("author").expect("author attached");
        assert_eq!(author.get("name"), Value::from("Bob"));
    });

    let stats = conn.stats();
    assert_eq!((stats.inserts, stats.updates), (1, 0));
    assert_eq!(conn.row_count("users"), 1);
}

#[test]
fn nested_update_only_touches_changed_rows() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    conn.seed("users", &json!([{"id": 1, "name": "Ada"}]))
        .expect("seed users");
    conn.seed("user_about", &json!([{"id": 1, "user_id": 1, "bio": "old"}]))
        .expect("seed about");
    let mut session = Session::new(conn.clone());

    rt.block_on(async {
        let user = unwrap_outcome(
            session
                .save(
                    &cx,
                    (users(), json!({"id": 1, "about": {"id": 1, "bio": "new"}})),
                    &mut SaveOptions::default(),
                )
                .await,
        );
        assert_eq!(user.get("name"), Value::from("Ada"));
        let about = user.related_one("about").expect("about attached");
        assert_eq!(about.get("bio"), Value::from("new"));
        assert_eq!(about.get("user_id"), Value::BigInt(1));
    });

    let stats = conn.stats();
    assert_eq!((stats.inserts, stats.updates), (0, 1));
    assert!(
        conn.statements()
            .iter()
            .any(|s| s == r#"UPDATE "user_about" SET "bio" = $1 WHERE "id" = $2"#)
    );
}

#[test]
fn custom_identity_applies_to_top_level_only() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    conn.seed("users", &json!([{"id": 3, "name": "Cy", "email": "cy@example.com"}]))
        .expect("seed users");
    conn.seed("posts", &json!([{"id": 10, "user_id": 3, "title": "Draft"}]))
        .expect("seed posts");
    let mut session = Session::new(conn.clone());
    let mut options = SaveOptions::new().identity(|r: &Record| vec![("email", r.value("email"))]);

    rt.block_on(async {
        let user = unwrap_outcome(
            session
                .save(
                    &cx,
                    (
                        users(),
                        json!({"email": "cy@example.com", "posts": [{"id": 10, "title": "Final"}]}),
                    ),
                    &mut options,
                )
                .await,
        );
        assert_eq!(user.get("id"), Value::BigInt(3));
        let post = &user.related_many("posts")[0];
        assert_eq!(post.get("title"), Value::from("Final"));
    });

    let stats = conn.stats();
    assert_eq!((stats.inserts, stats.updates), (0, 1));
}

#[test]
fn hooks_run_for_nested_children() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    let mut session = Session::new(conn.clone());
    let mut seen = Vec::new();
    let mut options = SaveOptions::new().before(|instance, is_new| {
        seen.push((instance.schema().name(), is_new));
    });

    rt.block_on(async {
        unwrap_outcome(
            session
                .save(
                    &cx,
                    (users(), json!({"name": "Ada", "about": {"bio": "x"}, "posts": [{"title": "p"}]})),
                    &mut options,
                )
                .await,
        );
    });
    drop(options);

    assert_eq!(
        seen,
        vec![("User", true), ("UserAbout", true), ("Post", true)]
    );
}

#[test]
fn instances_built_in_code_are_reconciled_like_mappings() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let conn = database();
    let mut session = Session::new(conn.clone());

    let user = Instance::new(users());
    user.set("name", "Grace").expect("set name");
    let about = Instance::new(user_about());
    about.set("bio", "Admiral").expect("set bio");
    user.set_related("about", Related::One(Some(about.clone())))
        .expect("set about");

    rt.block_on(async {
        let saved = unwrap_outcome(session.save(&cx, &user, &mut SaveOptions::default()).await);
        assert!(saved.ptr_eq(&user));
    });
    assert_eq!(about.get("user_id"), user.get("id"));
    assert_eq!(conn.row_count("user_about"), 1);
}
