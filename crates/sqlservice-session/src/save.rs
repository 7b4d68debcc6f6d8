//! Save/upsert: merge inputs into tracked instances or register them for insert.
//!
//! [`Session::save_all`] resolves each input's identity, merges it into the
//! tracked (or loaded) instance with that identity, or registers it as new,
//! then reconciles its relationships. The batch runs inside one transaction
//! scope and is flushed before the scope exits.

use crate::identity::{IdentityFn, resolve_identity};
use crate::transaction::ScopeOptions;
use crate::{ObjectState, Session};
use asupersync::{Cx, Outcome};
use sqlservice_core::{Connection, Error, Instance, ModelSchema, Related, RelationshipInfo, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Hook called with the saved instance and whether it is being inserted.
pub type SaveHook<'a> = dyn FnMut(&Instance, bool) + 'a;

type SaveFuture<'s> = Pin<Box<dyn Future<Output = Outcome<Instance, Error>> + 's>>;

/// Something that can be saved: an instance, or a JSON object for a model.
#[derive(Debug, Clone)]
pub enum Input {
    Instance(Instance),
    /// Converted with [`Instance::from_json`]; unknown keys are rejected and
    /// nested objects under relationship keys become related instances.
    Mapping(&'static ModelSchema, serde_json::Value),
}

impl Input {
    /// Normalize to an instance.
    pub fn into_instance(self) -> sqlservice_core::Result<Instance> {
        match self {
            Input::Instance(instance) => Ok(instance),
            Input::Mapping(schema, json) => Instance::from_json(schema, &json),
        }
    }
}

impl From<Instance> for Input {
    fn from(instance: Instance) -> Self {
        Input::Instance(instance)
    }
}

impl From<&Instance> for Input {
    fn from(instance: &Instance) -> Self {
        Input::Instance(instance.clone())
    }
}

impl From<(&'static ModelSchema, serde_json::Value)> for Input {
    fn from((schema, json): (&'static ModelSchema, serde_json::Value)) -> Self {
        Input::Mapping(schema, json)
    }
}

/// Options for [`Session::save`] and [`Session::save_all`].
pub struct SaveOptions<'a> {
    /// Custom identity for top-level inputs; nested instances always resolve
    /// by primary key.
    identity: Option<Box<IdentityFn<'a>>>,
    before: Option<Box<SaveHook<'a>>>,
    after: Option<Box<SaveHook<'a>>>,
    /// Commit when the save's scope is the outermost one.
    commit: bool,
}

impl Default for SaveOptions<'_> {
    fn default() -> Self {
        Self {
            identity: None,
            before: None,
            after: None,
            commit: true,
        }
    }
}

impl fmt::Debug for SaveOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveOptions")
            .field("identity", &self.identity.is_some())
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .field("commit", &self.commit)
            .finish()
    }
}

impl<'a> SaveOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match inputs on the `(column, value)` pairs `f` returns instead of the
    /// primary key.
    pub fn identity(
        mut self,
        f: impl Fn(&sqlservice_core::Record) -> Vec<(&'static str, Value)> + 'a,
    ) -> Self {
        self.identity = Some(Box::new(f));
        self
    }

    /// Called before an instance is registered with the session.
    pub fn before(mut self, f: impl FnMut(&Instance, bool) + 'a) -> Self {
        self.before = Some(Box::new(f));
        self
    }

    /// Called after an instance is registered with the session.
    pub fn after(mut self, f: impl FnMut(&Instance, bool) + 'a) -> Self {
        self.after = Some(Box::new(f));
        self
    }

    pub fn commit(mut self, value: bool) -> Self {
        self.commit = value;
        self
    }
}

impl<C: Connection> Session<C> {
    /// Save one input. See [`Session::save_all`].
    pub async fn save(
        &mut self,
        cx: &Cx,
        input: impl Into<Input>,
        options: &mut SaveOptions<'_>,
    ) -> Outcome<Instance, Error> {
        let instance = match input.into().into_instance() {
            Ok(instance) => instance,
            Err(e) => return Outcome::Err(e),
        };
        let scope = match self
            .enter_scope(cx, ScopeOptions::new().commit(options.commit))
            .await
        {
            Outcome::Ok(scope) => scope,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = match self.save_instance(cx, instance, options, true).await {
            Outcome::Ok(saved) => self.flush(cx).await.map(|_| saved),
            other => other,
        };
        self.exit_scope(cx, scope, result).await
    }

    /// Save every input in order and return the attached instances.
    ///
    /// Each input is matched by identity against tracked instances and then
    /// the database. A match receives the input's explicitly set values and
    /// is returned in its place; anything else is registered for insert.
    /// Relationships are saved recursively. The session is flushed before the
    /// surrounding scope exits, so generated keys are assigned and constraint
    /// violations surface here.
    ///
    /// All inputs are normalized before the transaction begins. An empty
    /// input returns an empty list without touching the database.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn save_all<I>(
        &mut self,
        cx: &Cx,
        inputs: I,
        options: &mut SaveOptions<'_>,
    ) -> Outcome<Vec<Instance>, Error>
    where
        I: IntoIterator,
        I::Item: Into<Input>,
    {
        let mut instances = Vec::new();
        for input in inputs {
            match input.into().into_instance() {
                Ok(instance) => instances.push(instance),
                Err(e) => return Outcome::Err(e),
            }
        }
        if instances.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        tracing::debug!(count = instances.len(), "saving batch");

        let scope = match self
            .enter_scope(cx, ScopeOptions::new().commit(options.commit))
            .await
        {
            Outcome::Ok(scope) => scope,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let result = self.save_batch(cx, instances, options).await;
        self.exit_scope(cx, scope, result).await
    }

    async fn save_batch(
        &mut self,
        cx: &Cx,
        instances: Vec<Instance>,
        options: &mut SaveOptions<'_>,
    ) -> Outcome<Vec<Instance>, Error> {
        let mut saved = Vec::with_capacity(instances.len());
        for instance in instances {
            match self.save_instance(cx, instance, options, true).await {
                Outcome::Ok(instance) => saved.push(instance),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        self.flush(cx).await.map(|_| saved)
    }

    /// Merge or add one instance, then reconcile its relationships.
    ///
    /// Targets of many-to-one relationships are saved first and their keys
    /// copied into this instance. Children of one-to-one and one-to-many
    /// relationships are saved after it, with this instance's key copied into
    /// theirs. Relationship cycles are not detected.
    fn save_instance<'s, 'o>(
        &'s mut self,
        cx: &'s Cx,
        instance: Instance,
        options: &'s mut SaveOptions<'o>,
        top_level: bool,
    ) -> SaveFuture<'s> {
        Box::pin(async move {
            let relations: Vec<(&'static RelationshipInfo, Related)> = instance
                .read()
                .relations()
                .map(|(rel, related)| (rel, related.clone()))
                .collect();
            let mut attached: Vec<(&'static str, Related)> = Vec::with_capacity(relations.len());

            for (rel, related) in &relations {
                if !rel.kind.local_holds_foreign_key() {
                    continue;
                }
                let Related::One(Some(target)) = related else {
                    attached.push((rel.name, related.clone()));
                    continue;
                };
                let target = match self.save_instance(cx, target.clone(), options, false).await {
                    Outcome::Ok(target) => target,
                    other => return other,
                };
                match self.ensure_keys(cx, &target, rel.remote_keys).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
                if let Err(e) = copy_keys(rel, &target, &instance) {
                    return Outcome::Err(e);
                }
                attached.push((rel.name, Related::One(Some(target))));
            }

            let identity_fn = if top_level {
                options.identity.as_deref()
            } else {
                None
            };
            let identity = match resolve_identity(&instance, identity_fn) {
                Ok(identity) => identity,
                Err(e) => return Outcome::Err(e),
            };
            let existing = match identity {
                Some(identity) => match self.get(cx, &identity).await {
                    Outcome::Ok(found) => found,
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                },
                None => None,
            };

            let model = match existing {
                Some(found) if found.ptr_eq(&instance) => found,
                Some(found) => {
                    let changed = found.write().merge_values_from(&instance.read());
                    tracing::debug!(
                        model = found.schema().name(),
                        changed,
                        "merged input into existing instance"
                    );
                    found
                }
                None => instance.clone(),
            };
            let is_new = !matches!(
                self.object_state(&model),
                Some(ObjectState::Persistent | ObjectState::Expired)
            );

            if let Some(before) = options.before.as_mut() {
                before(&model, is_new);
            }
            self.add(&model);
            if let Some(after) = options.after.as_mut() {
                after(&model, is_new);
            }

            for (rel, related) in &relations {
                if rel.kind.local_holds_foreign_key() {
                    continue;
                }
                let children = related.instances();
                if !children.is_empty() {
                    match self.ensure_keys(cx, &model, rel.local_keys).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                let mut saved = Vec::with_capacity(children.len());
                for child in children {
                    if let Err(e) = copy_keys(rel, &model, &child) {
                        return Outcome::Err(e);
                    }
                    match self.save_instance(cx, child, options, false).await {
                        Outcome::Ok(child) => saved.push(child),
                        other => return other,
                    }
                }
                let value = match related {
                    Related::One(_) => Related::One(saved.into_iter().next()),
                    Related::Many(_) => Related::Many(saved),
                };
                attached.push((rel.name, value));
            }

            for (name, value) in attached {
                if let Err(e) = model.set_related(name, value) {
                    return Outcome::Err(e);
                }
            }
            Outcome::Ok(model)
        })
    }

    /// Flush when `instance` is pending and any of `columns` has no value yet,
    /// so generated keys are available to copy.
    async fn ensure_keys(
        &mut self,
        cx: &Cx,
        instance: &Instance,
        columns: &[&str],
    ) -> Outcome<(), Error> {
        let missing = {
            let record = instance.read();
            columns
                .iter()
                .any(|name| record.get(name).is_none_or(Value::is_null))
        };
        if !missing || self.object_state(instance) != Some(ObjectState::New) {
            return Outcome::Ok(());
        }
        tracing::debug!(
            model = instance.schema().name(),
            "flushing to generate key for related rows"
        );
        self.flush(cx).await.map(|_| ())
    }
}

/// Copy key values along `rel` from `source` into `dest`.
fn copy_keys(
    rel: &RelationshipInfo,
    source: &Instance,
    dest: &Instance,
) -> sqlservice_core::Result<()> {
    let values: Vec<(&'static str, Value)> = {
        let record = source.read();
        rel.key_flow()
            .map(|(from, to)| (to, record.value(from)))
            .collect()
    };
    let mut record = dest.write();
    for (name, value) in values {
        record.set_silent(name, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryConnection;
    use asupersync::runtime::RuntimeBuilder;
    use serde_json::json;
    use sqlservice_core::{Column, SqlType};
    use std::sync::LazyLock;

    static ITEMS: LazyLock<ModelSchema> = LazyLock::new(|| {
        ModelSchema::builder("Item", "items")
            .column(Column::new("id", SqlType::BigInt).primary_key().auto_increment())
            .column(Column::new("name", SqlType::Text))
            .column(Column::new("note", SqlType::Text))
            .build()
            .unwrap()
    });

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[test]
    fn input_conversions() {
        let instance = Instance::from_json(&ITEMS, &json!({"name": "a"})).unwrap();
        assert!(matches!(Input::from(&instance), Input::Instance(_)));
        let mapped = Input::from((&*ITEMS, json!({"name": "b"})))
            .into_instance()
            .unwrap();
        assert_eq!(mapped.get("name"), Value::from("b"));
        assert!(
            Input::from((&*ITEMS, json!({"colour": "red"})))
                .into_instance()
                .is_err()
        );
    }

    #[test]
    fn save_options_debug_hides_closures() {
        let options = SaveOptions::new().before(|_, _| {}).commit(false);
        let rendered = format!("{options:?}");
        assert!(rendered.contains("before: true"));
        assert!(rendered.contains("commit: false"));
    }

    #[test]
    fn merge_keeps_unset_columns() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);
        conn.seed("items", &json!([{"id": 1, "name": "a", "note": "keep"}]))
            .unwrap();
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let saved = unwrap_outcome(
                session
                    .save(&cx, (&*ITEMS, json!({"id": 1, "name": "b"})), &mut SaveOptions::default())
                    .await,
            );
            assert_eq!(saved.get("name"), Value::from("b"));
            assert_eq!(saved.get("note"), Value::from("keep"));
        });
        let row = conn.find("items", "id", 1_i64).expect("row 1");
        assert_eq!(row.get("note"), Some(&Value::from("keep")));
        assert_eq!(conn.stats().updates, 1);
    }

    #[test]
    fn nested_save_without_commit_leaves_transaction_open() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let saved = unwrap_outcome(
                session
                    .save(
                        &cx,
                        (&*ITEMS, json!({"name": "draft"})),
                        &mut SaveOptions::new().commit(false),
                    )
                    .await,
            );
            assert_eq!(saved.get("id"), Value::BigInt(1));
            assert!(session.in_transaction());
        });
        assert_eq!(conn.stats().commits, 0);
        assert_eq!(conn.stats().inserts, 1);
    }

    #[test]
    fn empty_batch_does_not_begin() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MemoryConnection::with_models(&[&ITEMS]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let saved = unwrap_outcome(
                session
                    .save_all(&cx, Vec::<Input>::new(), &mut SaveOptions::default())
                    .await,
            );
            assert!(saved.is_empty());
        });
        assert_eq!(conn.stats().statements, 0);
    }
}
