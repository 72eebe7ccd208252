//! Test fixtures for ormtrack integration tests.
//!
//! Model: `Blog` 1..* `Post` (required, cascade) and `Author` 0..1 - * `Post`
//! (optional). Keys are store-generated; `Blog.version` is a row version.

#![allow(dead_code)]

use ormtrack::prelude::*;

pub fn model() -> Arc<Model> {
    Arc::new(
        Model::builder()
            .entity(
                EntityType::new("Blog")
                    .property(
                        Property::new("id", ValueKind::BigInt)
                            .key()
                            .generated(ValueGenerated::OnAdd),
                    )
                    .property(Property::new("name", ValueKind::Text))
                    .property(
                        Property::new("version", ValueKind::BigInt)
                            .concurrency_token()
                            .generated(ValueGenerated::OnAddOrUpdate),
                    ),
            )
            .entity(
                EntityType::new("Author")
                    .property(
                        Property::new("id", ValueKind::BigInt)
                            .key()
                            .generated(ValueGenerated::OnAdd),
                    )
                    .property(Property::new("name", ValueKind::Text)),
            )
            .entity(
                EntityType::new("Post")
                    .property(
                        Property::new("id", ValueKind::BigInt)
                            .key()
                            .generated(ValueGenerated::OnAdd),
                    )
                    .property(Property::new("title", ValueKind::Text))
                    .property(Property::new("blog_id", ValueKind::BigInt))
                    .property(Property::new("author_id", ValueKind::BigInt).nullable()),
            )
            .relationship(
                ForeignKey::new("Post", ["blog_id"], "Blog")
                    .dependent_navigation("blog")
                    .principal_navigation("posts")
                    .required(),
            )
            .relationship(
                ForeignKey::new("Post", ["author_id"], "Author")
                    .dependent_navigation("author")
                    .principal_navigation("posts"),
            )
            .build()
            .expect("fixture model is valid"),
    )
}

pub fn session() -> Session<MemoryGateway> {
    session_with(SessionConfig::default())
}

pub fn session_with(config: SessionConfig) -> Session<MemoryGateway> {
    let model = model();
    Session::with_config(MemoryGateway::new(Arc::clone(&model)), model, config)
}

pub fn blog(id: i64, name: &str) -> EntityRef {
    DynamicEntity::new("Blog")
        .with("id", id)
        .with("name", name)
        .with("version", 0_i64)
        .into_ref()
}

pub fn author(id: i64, name: &str) -> EntityRef {
    DynamicEntity::new("Author")
        .with("id", id)
        .with("name", name)
        .into_ref()
}

pub fn post(id: i64, title: &str) -> EntityRef {
    DynamicEntity::new("Post")
        .with("id", id)
        .with("title", title)
        .with("blog_id", 0_i64)
        .with("author_id", Value::Null)
        .into_ref()
}

/// Seed a stored blog row and return a matching detached instance.
pub fn stored_blog(session: &Session<MemoryGateway>, id: i64, name: &str) -> EntityRef {
    session
        .gateway()
        .seed(
            "Blog",
            [
                ("id", Value::BigInt(id)),
                ("name", Value::from(name)),
                ("version", Value::BigInt(1)),
            ],
        )
        .expect("seed blog");
    let b = blog(id, name);
    b.borrow_mut().set_value("version", Value::BigInt(1));
    b
}

/// Seed a stored post row and return a matching detached instance.
pub fn stored_post(session: &Session<MemoryGateway>, id: i64, title: &str, blog_id: i64) -> EntityRef {
    session
        .gateway()
        .seed(
            "Post",
            [
                ("id", Value::BigInt(id)),
                ("title", Value::from(title)),
                ("blog_id", Value::BigInt(blog_id)),
                ("author_id", Value::Null),
            ],
        )
        .expect("seed post");
    let p = post(id, title);
    p.borrow_mut().set_value("blog_id", Value::BigInt(blog_id));
    p
}

pub fn value(entity: &EntityRef, property: &str) -> Value {
    entity.borrow().get_value(property).unwrap_or(Value::Null)
}

pub fn contains(items: &[EntityRef], item: &EntityRef) -> bool {
    ormtrack::core::contains_entity(items, item)
}

pub fn same(a: &EntityRef, b: &EntityRef) -> bool {
    ormtrack::EntityId::of(a) == ormtrack::EntityId::of(b)
}
