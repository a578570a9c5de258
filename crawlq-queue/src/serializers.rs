use super::{Task, TaskQueueError};
use serde::{de::DeserializeOwned, Serialize};

/// Encodes task bodies for storage. Backends keep mutable state (retries,
/// priority, lease, outcome) beside the body, so only the submitted task is
/// serialized.
pub trait TaskSerializer: Send + Sync {
    fn serialize_task<T>(task: &Task<T>) -> Result<Vec<u8>, TaskQueueError>
    where
        T: Clone + Serialize + DeserializeOwned;

    fn deserialize_task<T>(data: &[u8]) -> Result<Task<T>, TaskQueueError>
    where
        T: Clone + Serialize + DeserializeOwned;

    fn serialize_value<V: Serialize>(value: &V) -> Result<String, TaskQueueError>;

    fn deserialize_value<V: DeserializeOwned>(data: &str) -> Result<V, TaskQueueError>;
}

#[derive(Debug, Clone, Copy)]
pub struct JsonSerializer;

impl TaskSerializer for JsonSerializer {
    fn serialize_task<T>(task: &Task<T>) -> Result<Vec<u8>, TaskQueueError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        serde_json::to_vec(task)
            .map_err(|e| TaskQueueError::Serialization(e.to_string()))
    }

    fn deserialize_task<T>(data: &[u8]) -> Result<Task<T>, TaskQueueError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        serde_json::from_slice(data)
            .map_err(|e| TaskQueueError::Deserialization(e.to_string()))
    }

    fn serialize_value<V: Serialize>(value: &V) -> Result<String, TaskQueueError> {
        serde_json::to_string(value)
            .map_err(|e| TaskQueueError::Serialization(e.to_string()))
    }

    fn deserialize_value<V: DeserializeOwned>(data: &str) -> Result<V, TaskQueueError> {
        serde_json::from_str(data)
            .map_err(|e| TaskQueueError::Deserialization(e.to_string()))
    }
}
