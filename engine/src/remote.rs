//! Remote client contract and operation naming.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::Result, schema::ModelSchema, Error, Record};

/// A single error returned by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteError {
    pub message: String,
    /// Present when the remote rejected a write because the record moved on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_state: Option<Record>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            server_state: None,
        }
    }

    pub fn conflict(message: impl Into<String>, server_state: Record) -> Self {
        Self {
            message: message.into(),
            server_state: Some(server_state),
        }
    }
}

/// Response to a query or mutation, or one item of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RemoteError>,
}

impl RemoteResponse {
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    pub fn error(error: RemoteError) -> Self {
        Self {
            data: None,
            errors: vec![error],
        }
    }

    /// Server state attached to the first conflict error, if any.
    pub fn conflict_state(&self) -> Option<&Record> {
        self.errors.iter().find_map(|e| e.server_state.as_ref())
    }

    /// Payload of `operation`.
    ///
    /// Accepts both `{"<operation>": payload}` and a bare payload. Remote
    /// errors become [`Error::Application`].
    pub fn into_payload(self, operation: &str) -> Result<Value> {
        if !self.errors.is_empty() {
            let message = self
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::Application(message));
        }
        match self.data {
            Some(Value::Object(mut map)) if map.contains_key(operation) => {
                Ok(map.remove(operation).unwrap_or(Value::Null))
            }
            Some(data) => Ok(data),
            None => Err(Error::Application(format!(
                "{} returned neither data nor errors",
                operation
            ))),
        }
    }
}

/// Stream of subscription items.
pub type RemoteStream = BoxStream<'static, RemoteResponse>;

/// Transport to the remote store.
///
/// Transport-level failures (connection refused, timeouts) must surface as
/// [`Error::Network`]; anything the remote answered belongs in the response.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn mutate(&self, operation: &str, variables: Value) -> Result<RemoteResponse>;

    async fn query(&self, operation: &str, variables: Value) -> Result<RemoteResponse>;

    /// Open a subscription. The stream ends when the connection drops.
    async fn subscribe(&self, operation: &str, variables: Value) -> Result<RemoteStream>;
}

/// Remote operation names of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOperations {
    pub create: String,
    pub update: String,
    pub delete: String,
    pub sync: String,
    pub on_create: String,
    pub on_update: String,
    pub on_delete: String,
}

impl ModelOperations {
    /// GraphQLCRUD names: `createNote`, `syncNote`, `newNote`, ...
    pub fn graphql_crud(model: &str) -> Self {
        Self {
            create: format!("create{}", model),
            update: format!("update{}", model),
            delete: format!("delete{}", model),
            sync: format!("sync{}", model),
            on_create: format!("new{}", model),
            on_update: format!("updated{}", model),
            on_delete: format!("deleted{}", model),
        }
    }

    pub fn for_schema(schema: &ModelSchema) -> Self {
        Self::graphql_crud(schema.name())
    }
}

/// Rename fields to their remote names.
pub fn to_remote(schema: &ModelSchema, record: &Record) -> Record {
    record
        .iter()
        .map(|(key, value)| {
            let name = schema
                .field(key)
                .map_or(key.as_str(), |f| f.remote_name());
            (name.to_string(), value.clone())
        })
        .collect()
}

/// Rename remote fields back to local names. Unknown fields pass through.
pub fn from_remote(schema: &ModelSchema, record: &Record) -> Record {
    record
        .iter()
        .map(|(key, value)| {
            let name = schema
                .fields()
                .iter()
                .find(|f| f.remote_name() == key)
                .map_or(key.as_str(), |f| f.name.as_str());
            (name.to_string(), value.clone())
        })
        .collect()
}
