//! Client id to server id rewriting of queued requests.

use serde_json::Value;

use super::MutationRequest;
use crate::{registry::ModelRegistry, QueueEntryId};

/// Replace `client_id` with `server_id` in the primary key of every request.
///
/// Only the declared primary-key field of each request's payload and base
/// snapshot is inspected. Returns the ids of the rewritten requests.
pub fn rewrite_ids<'a>(
    requests: impl IntoIterator<Item = &'a mut MutationRequest>,
    models: &ModelRegistry,
    client_id: &str,
    server_id: &Value,
) -> Vec<QueueEntryId> {
    let mut rewritten = Vec::new();

    for request in requests {
        let Some(schema) = models.get(&request.store_name) else {
            continue;
        };
        let pk = schema.primary_key();

        let mut touched = false;
        for record in std::iter::once(&mut request.data).chain(request.base.as_mut()) {
            if let Some(key) = record.get_mut(pk) {
                if key.as_str() == Some(client_id) {
                    *key = server_id.clone();
                    touched = true;
                }
            }
        }

        if touched {
            tracing::debug!(
                entry = %request.id,
                store = %request.store_name,
                "rewrote client id in queued request"
            );
            rewritten.push(request.id.clone());
        }
    }

    rewritten
}
