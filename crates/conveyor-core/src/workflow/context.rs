//! Per-run data store shared by every step of a workflow run.
//!
//! `WorkflowContext` holds four kinds of state:
//! - named values (last writer wins, steps own their key hygiene)
//! - per-step-type input and output slots, keyed by the step's type name
//! - the last output, read by the next step as its implicit input
//! - singletons keyed by type, such as the run handle or a captured failure
//!
//! Values are stored as JSON and singletons as immutable `Arc`s, so `clone`
//! yields an independent snapshot: forked branches work on their own copy and
//! no locking is needed.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use conveyor_types::error::ContextError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Key used for the last-output slot in error messages.
const LAST_OUTPUT_KEY: &str = "<last output>";

type Singleton = Arc<dyn Any + Send + Sync>;

/// Mutable state flowing through a workflow run.
#[derive(Clone, Default)]
pub struct WorkflowContext {
    run_id: Option<Uuid>,
    values: HashMap<String, Value>,
    inputs: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
    last_output: Option<Value>,
    singletons: HashMap<TypeId, Singleton>,
}

/// Slot key for the inputs and outputs of step type `S`.
pub fn step_key<S: ?Sized>() -> &'static str {
    std::any::type_name::<S>()
}

impl WorkflowContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the last-output slot so the first step receives `input`.
    pub fn with_input(mut self, input: Value) -> Self {
        self.last_output = Some(input);
        self
    }

    /// Identifier of the run currently (or most recently) using this context.
    pub fn run_id(&self) -> Option<Uuid> {
        self.run_id
    }

    pub(crate) fn set_run_id(&mut self, run_id: Option<Uuid>) {
        self.run_id = run_id;
    }

    // -----------------------------------------------------------------------
    // Named values
    // -----------------------------------------------------------------------

    /// Read a named value as `T`.
    ///
    /// Fails with `Missing` if the key is absent and `TypeMismatch` if the
    /// stored value does not deserialize into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ContextError> {
        let value = self.values.get(key).ok_or_else(|| ContextError::Missing {
            key: key.to_string(),
        })?;
        decode(key, value)
    }

    /// Like [`get`](Self::get) but folds both errors into `None`.
    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key).ok()
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Store a named value, replacing any previous one.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) -> Result<(), ContextError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| ContextError::Serialize {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.values.insert(key, value);
        Ok(())
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    // -----------------------------------------------------------------------
    // Per-step input / output
    // -----------------------------------------------------------------------

    pub fn set_input(&mut self, step_key: &str, value: Value) {
        self.inputs.insert(step_key.to_string(), value);
    }

    pub fn input(&self, step_key: &str) -> Option<&Value> {
        self.inputs.get(step_key)
    }

    /// Input last fed to a step of type `S`.
    pub fn input_of<S: ?Sized>(&self) -> Option<&Value> {
        self.input(step_key::<S>())
    }

    pub fn set_output(&mut self, step_key: &str, value: Value) {
        self.outputs.insert(step_key.to_string(), value);
    }

    pub fn output(&self, step_key: &str) -> Option<&Value> {
        self.outputs.get(step_key)
    }

    /// Output last produced by a step of type `S`.
    pub fn output_of<S: ?Sized>(&self) -> Option<&Value> {
        self.output(step_key::<S>())
    }

    // -----------------------------------------------------------------------
    // Last output
    // -----------------------------------------------------------------------

    pub fn last_output(&self) -> Option<&Value> {
        self.last_output.as_ref()
    }

    pub fn set_last_output(&mut self, value: Value) {
        self.last_output = Some(value);
    }

    /// Read the last output as `T`.
    pub fn last_output_as<T: DeserializeOwned>(&self) -> Result<T, ContextError> {
        let value = self.last_output.as_ref().ok_or_else(|| ContextError::Missing {
            key: LAST_OUTPUT_KEY.to_string(),
        })?;
        decode(LAST_OUTPUT_KEY, value)
    }

    // -----------------------------------------------------------------------
    // Singletons
    // -----------------------------------------------------------------------

    /// Store the single instance of `T`, returning the one it replaced.
    pub fn set_singleton<T: Any + Send + Sync>(&mut self, value: Arc<T>) -> Option<Arc<T>> {
        self.singletons
            .insert(TypeId::of::<T>(), value)
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    pub fn singleton<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.singletons
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn remove_singleton<T: Any + Send + Sync>(&mut self) -> Option<Arc<T>> {
        self.singletons
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    /// JSON snapshot of everything except singletons.
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "values": to_object(&self.values),
            "inputs": to_object(&self.inputs),
            "outputs": to_object(&self.outputs),
            "last_output": self.last_output,
        })
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: &Value) -> Result<T, ContextError> {
    serde_json::from_value(value.clone()).map_err(|e| ContextError::TypeMismatch {
        key: key.to_string(),
        expected: std::any::type_name::<T>(),
        message: e.to_string(),
    })
}

fn to_object(map: &HashMap<String, Value>) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<_, _>>())
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("run_id", &self.run_id)
            .field("values", &self.values)
            .field("last_output", &self.last_output)
            .field("singletons", &self.singletons.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker(u32);

    // --- Named values ---

    #[test]
    fn test_get_and_set_typed_value() {
        let mut ctx = WorkflowContext::new();
        ctx.set("count", 3u32).unwrap();
        ctx.set("tags", vec!["a", "b"]).unwrap();

        assert_eq!(ctx.get::<u32>("count").unwrap(), 3);
        assert_eq!(ctx.get::<Vec<String>>("tags").unwrap(), vec!["a", "b"]);
        assert!(ctx.contains("count"));
    }

    #[test]
    fn test_get_missing_key_is_error() {
        let ctx = WorkflowContext::new();
        let err = ctx.get::<u32>("nope").unwrap_err();
        assert_eq!(err, ContextError::Missing { key: "nope".into() });
        assert_eq!(ctx.try_get::<u32>("nope"), None);
    }

    #[test]
    fn test_get_wrong_type_is_mismatch() {
        let mut ctx = WorkflowContext::new();
        ctx.set_value("name", json!("deploy"));
        let err = ctx.get::<u64>("name").unwrap_err();
        assert!(matches!(err, ContextError::TypeMismatch { ref key, .. } if key == "name"));
    }

    #[test]
    fn test_last_writer_wins() {
        let mut ctx = WorkflowContext::new();
        ctx.set("x", 1).unwrap();
        ctx.set("x", "one").unwrap();
        assert_eq!(ctx.get::<String>("x").unwrap(), "one");
        assert_eq!(ctx.remove("x"), Some(json!("one")));
        assert!(!ctx.contains("x"));
    }

    // --- Input / output slots ---

    #[test]
    fn test_step_slots_keyed_by_type() {
        let mut ctx = WorkflowContext::new();
        ctx.set_output(step_key::<Marker>(), json!({"ok": true}));
        ctx.set_input(step_key::<Marker>(), json!(7));

        assert_eq!(ctx.output_of::<Marker>(), Some(&json!({"ok": true})));
        assert_eq!(ctx.input_of::<Marker>(), Some(&json!(7)));
        assert_eq!(ctx.output_of::<String>(), None);
    }

    #[test]
    fn test_with_input_seeds_last_output() {
        let ctx = WorkflowContext::new().with_input(json!(41));
        assert_eq!(ctx.last_output_as::<i32>().unwrap(), 41);
    }

    #[test]
    fn test_last_output_missing() {
        let ctx = WorkflowContext::new();
        assert!(matches!(
            ctx.last_output_as::<i32>(),
            Err(ContextError::Missing { .. })
        ));
    }

    // --- Singletons ---

    #[test]
    fn test_singleton_replace_and_remove() {
        let mut ctx = WorkflowContext::new();
        assert!(ctx.set_singleton(Arc::new(Marker(1))).is_none());
        let previous = ctx.set_singleton(Arc::new(Marker(2))).unwrap();
        assert_eq!(previous.0, 1);
        assert_eq!(ctx.singleton::<Marker>().unwrap().0, 2);
        assert_eq!(ctx.remove_singleton::<Marker>().unwrap().0, 2);
        assert!(ctx.singleton::<Marker>().is_none());
    }

    // --- Clone isolation ---

    #[test]
    fn test_clone_is_independent_snapshot() {
        let mut original = WorkflowContext::new();
        original.set("x", 1).unwrap();

        let mut copy = original.clone();
        copy.set("x", 2).unwrap();
        copy.set_last_output(json!("branch"));
        copy.set_singleton(Arc::new(Marker(9)));

        assert_eq!(original.get::<i32>("x").unwrap(), 1);
        assert_eq!(copy.get::<i32>("x").unwrap(), 2);
        assert!(original.last_output().is_none());
        assert!(original.singleton::<Marker>().is_none());

        original.set("y", true).unwrap();
        assert!(!copy.contains("y"));
    }

    #[test]
    fn test_to_json_snapshot() {
        let mut ctx = WorkflowContext::new();
        ctx.set("answer", 42).unwrap();
        ctx.set_last_output(json!("done"));
        let snapshot = ctx.to_json();
        assert_eq!(snapshot["values"]["answer"], 42);
        assert_eq!(snapshot["last_output"], "done");
        assert!(snapshot["run_id"].is_null());
    }
}
