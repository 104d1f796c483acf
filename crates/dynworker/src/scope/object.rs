use std::sync::{Arc, Weak};

use dashmap::DashMap;

use super::value::{Function, NotSerializable, Outcome, Value};
use crate::fault::Fault;

type Getter = dyn Fn() -> Value + Send + Sync;
type Setter = dyn Fn(Value) -> Result<(), Fault> + Send + Sync;

/// Named entry in an [`Object`].
#[derive(Clone)]
pub enum Member {
    Value(Value),
    Function(Function),
    Property(Property),
}

impl Member {
    fn resolve(&self) -> Value {
        match self {
            Self::Value(value) => value.clone(),
            Self::Function(function) => Value::Function(function.clone()),
            Self::Property(property) => property.get(),
        }
    }
}

impl From<Value> for Member {
    fn from(value: Value) -> Self {
        match value {
            Value::Function(function) => Self::Function(function),
            value => Self::Value(value),
        }
    }
}

impl From<serde_json::Value> for Member {
    fn from(data: serde_json::Value) -> Self {
        Self::Value(Value::Data(data))
    }
}

impl From<Function> for Member {
    fn from(function: Function) -> Self {
        Self::Function(function)
    }
}

impl From<Object> for Member {
    fn from(object: Object) -> Self {
        Self::Value(Value::Object(object))
    }
}

impl From<Property> for Member {
    fn from(property: Property) -> Self {
        Self::Property(property)
    }
}

/// Accessor member: reads go through the getter, writes through the setter.
#[derive(Clone)]
pub struct Property {
    getter: Arc<Getter>,
    setter: Option<Arc<Setter>>,
}

impl Property {
    pub fn read_only<G>(getter: G) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
    {
        Self {
            getter: Arc::new(getter),
            setter: None,
        }
    }

    pub fn read_write<G, S>(getter: G, setter: S) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
        S: Fn(Value) -> Result<(), Fault> + Send + Sync + 'static,
    {
        Self {
            getter: Arc::new(getter),
            setter: Some(Arc::new(setter)),
        }
    }

    pub fn get(&self) -> Value {
        (self.getter)()
    }
}

/// Shared, concurrently mutable namespace.
///
/// Clones share the same members, like object references.
#[derive(Clone, Default)]
pub struct Object {
    members: Arc<DashMap<String, Member>>,
}

/// Non-owning handle to an [`Object`], for members that refer back to their owner.
#[derive(Clone, Default)]
pub struct WeakObject {
    members: Weak<DashMap<String, Member>>,
}

impl WeakObject {
    pub fn upgrade(&self) -> Option<Object> {
        self.members.upgrade().map(|members| Object { members })
    }
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    /// Object whose members are the entries of a JSON map.
    pub fn from_data(map: serde_json::Map<String, serde_json::Value>) -> Self {
        let object = Self::new();
        for (name, data) in map {
            object.insert(name, data);
        }
        object
    }

    pub fn insert(&self, name: impl Into<String>, member: impl Into<Member>) {
        self.members.insert(name.into(), member.into());
    }

    /// Shorthand for inserting a [`Function`] under its own name.
    pub fn define_function<F>(&self, name: &str, callable: F)
    where
        F: Fn(&Value, Vec<Value>) -> Outcome + Send + Sync + 'static,
    {
        self.insert(name, Function::new(name, callable));
    }

    pub fn remove(&self, name: &str) -> Option<Member> {
        self.members.remove(name).map(|(_, member)| member)
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        self.members.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn clear(&self) {
        self.members.clear();
    }

    pub fn names(&self) -> Vec<String> {
        self.members.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Current value of every member, getters included.
    pub fn entries(&self) -> Vec<(String, Value)> {
        // Collect first so getters never run while a shard is locked.
        let members: Vec<(String, Member)> = self
            .members
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        members
            .into_iter()
            .map(|(name, member)| (name, member.resolve()))
            .collect()
    }

    pub fn get(&self, name: &str) -> Value {
        self.member(name)
            .map(|member| member.resolve())
            .unwrap_or_default()
    }

    /// Assign a member and return the assigned value.
    pub fn set(&self, name: &str, value: Value) -> Outcome {
        match self.member(name) {
            Some(Member::Property(property)) => match &property.setter {
                Some(setter) => {
                    setter(value.clone())?;
                    Ok(value)
                }
                None => Err(Fault::read_only(name)),
            },
            _ => {
                self.insert(name, value.clone());
                Ok(value)
            }
        }
    }

    pub fn downgrade(&self) -> WeakObject {
        WeakObject {
            members: Arc::downgrade(&self.members),
        }
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.members, &other.members)
    }

    pub(crate) fn encode(
        &self,
        visiting: &mut Vec<usize>,
    ) -> Result<serde_json::Value, NotSerializable> {
        let address = Arc::as_ptr(&self.members) as usize;
        if visiting.contains(&address) {
            return Err(NotSerializable::Cycle);
        }
        visiting.push(address);
        let mut map = serde_json::Map::new();
        for (name, value) in self.entries() {
            match value.encode(visiting) {
                Ok(data) => {
                    map.insert(name, data);
                }
                Err(e) => {
                    visiting.pop();
                    return Err(e);
                }
            }
        }
        visiting.pop();
        Ok(serde_json::Value::Object(map))
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort();
        f.debug_struct("Object").field("members", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[test]
    fn clones_share_members() {
        let object = Object::new();
        let alias = object.clone();
        alias.insert("answer", json!(42));

        assert_eq!(object.get("answer").as_data(), Some(&json!(42)));
        assert!(object.ptr_eq(&alias));
    }

    #[test]
    fn missing_member_reads_undefined() {
        assert!(Object::new().get("nothing").is_undefined());
    }

    #[test]
    fn set_inserts_and_returns_value() {
        let object = Object::new();
        let assigned = object.set("x", json!(5).into()).unwrap();
        assert_eq!(assigned.as_data(), Some(&json!(5)));
        assert_eq!(object.get("x").as_data(), Some(&json!(5)));
    }

    #[test]
    fn functions_are_stored_as_function_members() {
        let object = Object::new();
        let f = Function::new("f", |_, _| Ok(Value::undefined()));
        object.set("f", f.into()).unwrap();
        assert!(matches!(object.member("f"), Some(Member::Function(_))));
    }

    #[test]
    fn properties_route_through_accessors() {
        let counter = Arc::new(AtomicI64::new(7));
        let object = Object::new();
        let read = Arc::clone(&counter);
        let write = Arc::clone(&counter);
        object.insert(
            "counter",
            Property::read_write(
                move || json!(read.load(Ordering::SeqCst)).into(),
                move |value| {
                    let n = value
                        .as_data()
                        .and_then(serde_json::Value::as_i64)
                        .ok_or_else(|| Fault::application("counter must be an integer"))?;
                    write.store(n, Ordering::SeqCst);
                    Ok(())
                },
            ),
        );

        assert_eq!(object.get("counter").as_data(), Some(&json!(7)));
        object.set("counter", json!(11).into()).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert!(object.set("counter", json!("eleven").into()).is_err());
    }

    #[test]
    fn read_only_property_rejects_writes() {
        let object = Object::new();
        object.insert("version", Property::read_only(|| json!("1.0").into()));
        let fault = object.set("version", json!("2.0").into()).unwrap_err();
        assert_eq!(fault.name(), "ReadOnly");
        assert_eq!(object.get("version").as_data(), Some(&json!("1.0")));
    }

    #[test]
    fn encode_nested_data_objects() {
        let inner = Object::from_data(json!({"port": 8080}).as_object().unwrap().clone());
        let outer = Object::new();
        outer.insert("config", inner);
        outer.insert("name", json!("relay"));

        let wire = Value::from(outer).to_wire().unwrap();
        assert_eq!(wire, json!({"config": {"port": 8080}, "name": "relay"}));
    }

    #[test]
    fn encode_detects_cycles() {
        let object = Object::new();
        let weak = object.downgrade();
        object.insert(
            "self",
            Property::read_only(move || weak.upgrade().map(Value::Object).unwrap_or_default()),
        );

        assert_eq!(
            Value::from(object.clone()).to_wire(),
            Err(NotSerializable::Cycle)
        );
    }

    #[test]
    fn shallow_copy_drops_unserializable_members() {
        let object = Object::new();
        object.insert("answer", json!(5));
        object.define_function("echo", |_, args| Ok(Value::list(args)));

        let value = Value::from(object);
        assert!(value.to_wire().is_err());
        assert_eq!(value.to_wire_shallow(), json!({"answer": 5}));
    }

    #[test]
    fn weak_handle_does_not_keep_object_alive() {
        let object = Object::new();
        let weak = object.downgrade();
        assert!(weak.upgrade().is_some());
        drop(object);
        assert!(weak.upgrade().is_none());
    }
}
