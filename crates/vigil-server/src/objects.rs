//! Named managed objects, their factories, and the notification emitter they
//! see while an operation runs.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;
use vigil_core::time::now_millis;
use vigil_core::{Notification, NotificationFilter, ServerFrame, SubscriptionId, Value, VigilError};

use crate::notify::SubscriptionTable;

/// Failure raised by a managed object itself.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("no attribute '{0}'")]
    NoSuchAttribute(String),

    #[error("attribute '{0}' is read-only")]
    ReadOnly(String),

    #[error("no operation '{0}'")]
    NoSuchOperation(String),

    #[error("invalid value for '{attribute}': {reason}")]
    InvalidValue { attribute: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

impl From<ObjectError> for VigilError {
    fn from(err: ObjectError) -> Self {
        match err {
            ObjectError::NoSuchAttribute(_) | ObjectError::NoSuchOperation(_) => {
                VigilError::NotFound(err.to_string())
            }
            other => VigilError::ExecutionFailed(other.to_string()),
        }
    }
}

/// Something that can be managed remotely.
///
/// Calls are serialized per object, so implementations need no locking of
/// their own.
pub trait ManagedObject: Send + 'static {
    fn get_attribute(&self, attribute: &str) -> Result<Value, ObjectError>;

    fn set_attribute(
        &mut self,
        attribute: &str,
        value: Value,
        events: &Emitter<'_>,
    ) -> Result<(), ObjectError>;

    fn invoke(
        &mut self,
        operation: &str,
        args: Vec<Value>,
        events: &Emitter<'_>,
    ) -> Result<Value, ObjectError>;
}

/// Builds a fresh object for a remote `register` call.
pub type ObjectFactory = Box<dyn Fn() -> Box<dyn ManagedObject> + Send + Sync>;

/// Identity of one registration: a name reused later gets a new generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub name: String,
    pub generation: u64,
}

struct ObjectEntry {
    key: ObjectKey,
    kind: String,
    object: Mutex<Box<dyn ManagedObject>>,
    sequence: AtomicU64,
    registered: AtomicBool,
}

/// Lets an object emit notifications from inside an operation.
pub struct Emitter<'a> {
    key: &'a ObjectKey,
    sequence: &'a AtomicU64,
    subscriptions: &'a SubscriptionTable,
}

impl Emitter<'_> {
    pub fn emit(&self, kind: &str, message: impl Into<String>, user_data: Option<Value>) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let notification = Notification {
            source: self.key.name.clone(),
            kind: kind.to_string(),
            message: message.into(),
            sequence,
            timestamp: now_millis(),
            user_data,
        };
        self.subscriptions.publish(self.key, &notification);
        sequence
    }
}

/// A resolved object, valid until it is unregistered.
pub struct ObjectHandle {
    entry: Arc<ObjectEntry>,
    subscriptions: Arc<SubscriptionTable>,
}

impl ObjectHandle {
    pub fn name(&self) -> &str {
        &self.entry.key.name
    }

    pub fn kind(&self) -> &str {
        &self.entry.kind
    }

    /// Runs `f` under the object's lock.
    ///
    /// `stopping` is checked once the lock is held; a panic inside the object
    /// is reported as `ExecutionFailed`.
    pub fn execute<R>(
        &self,
        stopping: &AtomicBool,
        f: impl FnOnce(&mut dyn ManagedObject, &Emitter<'_>) -> Result<R, ObjectError>,
    ) -> Result<R, VigilError> {
        let mut object = self.entry.object.lock();
        if stopping.load(Ordering::SeqCst) {
            return Err(VigilError::ServerStopping);
        }
        if !self.entry.registered.load(Ordering::SeqCst) {
            return Err(VigilError::NotFound(self.entry.key.name.clone()));
        }
        let emitter = Emitter {
            key: &self.entry.key,
            sequence: &self.entry.sequence,
            subscriptions: &self.subscriptions,
        };
        match catch_unwind(AssertUnwindSafe(|| f(&mut **object, &emitter))) {
            Ok(result) => result.map_err(VigilError::from),
            Err(_) => {
                warn!(object = %self.entry.key.name, "managed object panicked");
                Err(VigilError::ExecutionFailed(format!(
                    "object '{}' panicked",
                    self.entry.key.name
                )))
            }
        }
    }
}

pub struct ObjectRegistry {
    objects: RwLock<HashMap<String, Arc<ObjectEntry>>>,
    factories: RwLock<HashMap<String, ObjectFactory>>,
    subscriptions: Arc<SubscriptionTable>,
    generation: AtomicU64,
}

impl ObjectRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            subscriptions: Arc::new(SubscriptionTable::new(queue_capacity)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        &self.subscriptions
    }

    pub fn register(
        &self,
        name: &str,
        kind: &str,
        object: Box<dyn ManagedObject>,
    ) -> Result<(), VigilError> {
        let mut objects = self.objects.write();
        if objects.contains_key(name) {
            return Err(VigilError::DuplicateName(name.to_string()));
        }
        let key = ObjectKey {
            name: name.to_string(),
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        };
        info!(object = name, kind, generation = key.generation, "object registered");
        objects.insert(
            name.to_string(),
            Arc::new(ObjectEntry {
                key,
                kind: kind.to_string(),
                object: Mutex::new(object),
                sequence: AtomicU64::new(0),
                registered: AtomicBool::new(true),
            }),
        );
        Ok(())
    }

    pub fn register_factory(&self, kind: &str, factory: ObjectFactory) {
        self.factories.write().insert(kind.to_string(), factory);
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Registers a new object built by the factory for `kind`.
    pub fn create(&self, name: &str, kind: &str) -> Result<(), VigilError> {
        let object = {
            let factories = self.factories.read();
            let factory = factories
                .get(kind)
                .ok_or_else(|| VigilError::NotFound(format!("object kind '{kind}'")))?;
            factory()
        };
        self.register(name, kind, object)
    }

    /// Removes `name` and cancels every subscription to it before returning.
    pub fn unregister(&self, name: &str) -> Result<(), VigilError> {
        let mut objects = self.objects.write();
        let entry = objects
            .remove(name)
            .ok_or_else(|| VigilError::NotFound(name.to_string()))?;
        entry.registered.store(false, Ordering::SeqCst);
        let cancelled = self.subscriptions.remove_object(&entry.key);
        info!(object = name, cancelled, "object unregistered");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ObjectHandle, VigilError> {
        let entry = self
            .objects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| VigilError::NotFound(name.to_string()))?;
        Ok(ObjectHandle {
            entry,
            subscriptions: self.subscriptions.clone(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.objects.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes `session` to `name`. The read lock is held across the
    /// insert so a concurrent unregister cannot leave a dangling subscription.
    pub fn subscribe(
        &self,
        name: &str,
        session: Uuid,
        filter: NotificationFilter,
        sink: mpsc::Sender<ServerFrame>,
    ) -> Result<SubscriptionId, VigilError> {
        let objects = self.objects.read();
        let entry = objects
            .get(name)
            .ok_or_else(|| VigilError::NotFound(name.to_string()))?;
        Ok(self
            .subscriptions
            .subscribe(entry.key.clone(), session, filter, sink))
    }

    /// Emits a notification on behalf of `name` from outside an operation.
    /// Silently does nothing if the object is not registered.
    pub fn emit(&self, name: &str, kind: &str, message: &str, user_data: Option<Value>) {
        let Some(entry) = self.objects.read().get(name).cloned() else {
            return;
        };
        Emitter {
            key: &entry.key,
            sequence: &entry.sequence,
            subscriptions: &self.subscriptions,
        }
        .emit(kind, message, user_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[derive(Default)]
    struct Counter {
        value: i64,
    }

    impl ManagedObject for Counter {
        fn get_attribute(&self, attribute: &str) -> Result<Value, ObjectError> {
            match attribute {
                "Value" => Ok(Value::Int(self.value)),
                _ => Err(ObjectError::NoSuchAttribute(attribute.into())),
            }
        }

        fn set_attribute(
            &mut self,
            attribute: &str,
            value: Value,
            _events: &Emitter<'_>,
        ) -> Result<(), ObjectError> {
            match attribute {
                "Value" => {
                    self.value = value.as_int().ok_or_else(|| ObjectError::InvalidValue {
                        attribute: attribute.into(),
                        reason: "expected int".into(),
                    })?;
                    Ok(())
                }
                _ => Err(ObjectError::NoSuchAttribute(attribute.into())),
            }
        }

        fn invoke(
            &mut self,
            operation: &str,
            _args: Vec<Value>,
            events: &Emitter<'_>,
        ) -> Result<Value, ObjectError> {
            match operation {
                "increment" => {
                    self.value += 1;
                    events.emit("counter.changed", "incremented", Some(Value::Int(self.value)));
                    Ok(Value::Int(self.value))
                }
                "explode" => panic!("boom"),
                _ => Err(ObjectError::NoSuchOperation(operation.into())),
            }
        }
    }

    fn registry() -> ObjectRegistry {
        let registry = ObjectRegistry::new(8);
        registry.register_factory("counter", Box::new(|| Box::new(Counter::default())));
        registry
    }

    #[test]
    fn register_get_unregister() {
        let registry = registry();
        registry.create("c", "counter").unwrap();
        assert!(matches!(
            registry.create("c", "counter"),
            Err(VigilError::DuplicateName(_))
        ));
        assert_eq!(registry.get("c").unwrap().kind(), "counter");

        registry.unregister("c").unwrap();
        assert!(matches!(registry.get("c"), Err(VigilError::NotFound(_))));
        assert!(matches!(registry.unregister("c"), Err(VigilError::NotFound(_))));
    }

    #[test]
    fn unknown_kind_is_not_found() {
        assert!(matches!(
            registry().create("c", "gauge"),
            Err(VigilError::NotFound(_))
        ));
    }

    #[test]
    fn object_errors_map_to_wire_kinds() {
        let registry = registry();
        registry.create("c", "counter").unwrap();
        let handle = registry.get("c").unwrap();
        let stopping = AtomicBool::new(false);

        let missing = handle.execute(&stopping, |o, _| o.get_attribute("Nope"));
        assert!(matches!(missing, Err(VigilError::NotFound(_))));

        let invalid = handle.execute(&stopping, |o, e| o.set_attribute("Value", Value::from("x"), e));
        assert!(matches!(invalid, Err(VigilError::ExecutionFailed(_))));
    }

    #[test]
    fn panicking_object_does_not_poison_registry() {
        let registry = registry();
        registry.create("c", "counter").unwrap();
        let handle = registry.get("c").unwrap();
        let stopping = AtomicBool::new(false);

        let result = handle.execute(&stopping, |o, e| o.invoke("explode", vec![], e));
        assert!(matches!(result, Err(VigilError::ExecutionFailed(_))));

        let after = handle.execute(&stopping, |o, e| o.invoke("increment", vec![], e));
        assert_eq!(after.unwrap(), Value::Int(1));
    }

    #[test]
    fn stopping_flag_blocks_execution() {
        let registry = registry();
        registry.create("c", "counter").unwrap();
        let stopping = AtomicBool::new(true);
        let result = registry
            .get("c")
            .unwrap()
            .execute(&stopping, |o, _| o.get_attribute("Value"));
        assert!(matches!(result, Err(VigilError::ServerStopping)));
    }

    #[test]
    fn stale_handle_sees_unregistration() {
        let registry = registry();
        registry.create("c", "counter").unwrap();
        let handle = registry.get("c").unwrap();
        registry.unregister("c").unwrap();

        let result = handle.execute(&AtomicBool::new(false), |o, _| o.get_attribute("Value"));
        assert!(matches!(result, Err(VigilError::NotFound(_))));
    }

    #[tokio::test]
    async fn reregistered_name_does_not_inherit_subscriptions() {
        let registry = registry();
        registry.create("c", "counter").unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        registry
            .subscribe("c", Uuid::new_v4(), NotificationFilter::accept_all(), tx)
            .unwrap();

        registry.unregister("c").unwrap();
        assert!(registry.subscriptions().is_empty());

        registry.create("c", "counter").unwrap();
        registry.emit("c", "counter.changed", "after", None);
        registry.emit("ghost", "counter.changed", "nobody", None);

        let mut frames = Vec::new();
        while let Ok(Some(frame)) = timeout(Duration::from_millis(200), rx.recv()).await {
            frames.push(frame);
        }
        assert!(
            frames
                .iter()
                .all(|f| matches!(f, ServerFrame::SubscriptionEnded { .. })),
            "{frames:?}"
        );
    }

    #[tokio::test]
    async fn subscribe_to_missing_object_is_not_found() {
        let (tx, _rx) = mpsc::channel(16);
        assert!(matches!(
            registry().subscribe("ghost", Uuid::new_v4(), NotificationFilter::accept_all(), tx),
            Err(VigilError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_object() {
        let registry = registry();
        registry.create("c", "counter").unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        registry
            .subscribe("c", Uuid::new_v4(), NotificationFilter::accept_all(), tx)
            .unwrap();

        let handle = registry.get("c").unwrap();
        let stopping = AtomicBool::new(false);
        for _ in 0..3 {
            handle
                .execute(&stopping, |o, e| o.invoke("increment", vec![], e))
                .unwrap();
        }

        let mut sequences = Vec::new();
        while let Ok(Some(ServerFrame::Notification { notification, .. })) =
            timeout(Duration::from_millis(200), rx.recv()).await
        {
            sequences.push(notification.sequence);
        }
        assert_eq!(sequences, [1, 2, 3]);
    }
}
