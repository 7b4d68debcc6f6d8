//! Shared models and helpers for the session integration tests.

#![allow(dead_code)]

use asupersync::Outcome;
use sqlservice_core::{Column, Error, ModelSchema, RelationshipInfo, SqlType};
use sqlservice_session::testing::MemoryConnection;
use std::sync::LazyLock;

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn users() -> &'static ModelSchema {
    static USERS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("User", "users")
            .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
            .column(Column::new("name", SqlType::Text))
            .column(Column::new("email", SqlType::Text).unique())
            .relationship(RelationshipInfo::one_to_one("about", user_about, &["id"], &["user_id"]))
            .relationship(RelationshipInfo::one_to_many("posts", posts, &["id"], &["user_id"]))
            .build()
            .expect("valid User schema")
    });
    &USERS
}

pub fn user_about() -> &'static ModelSchema {
    static ABOUT: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("UserAbout", "user_about")
            .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
            .column(Column::new("user_id", SqlType::BigInt).foreign_key("users.id"))
            .column(Column::new("bio", SqlType::Text))
            .build()
            .expect("valid UserAbout schema")
    });
    &ABOUT
}

pub fn posts() -> &'static ModelSchema {
    static POSTS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Post", "posts")
            .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
            .column(Column::new("user_id", SqlType::BigInt).foreign_key("users.id"))
            .column(Column::new("title", SqlType::Text).not_null())
            .relationship(RelationshipInfo::many_to_one("author", users, &["user_id"], &["id"]))
            .build()
            .expect("valid Post schema")
    });
    &POSTS
}

/// Composite primary key, no generated values.
pub fn memberships() -> &'static ModelSchema {
    static MEMBERSHIPS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Membership", "memberships")
            .column(Column::new("group_id", SqlType::BigInt).primary_key())
            .column(Column::new("user_id", SqlType::BigInt).primary_key())
            .column(Column::new("role", SqlType::Text))
            .build()
            .expect("valid Membership schema")
    });
    &MEMBERSHIPS
}

pub fn database() -> MemoryConnection {
    MemoryConnection::with_models(&[users(), user_about(), posts(), memberships()])
}
