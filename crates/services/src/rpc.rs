//! Remote procedure calls
//!
//! The cloud delivers calls as observation notifications on `.rpc/`:
//! `{"id", "method", "params"}`. Registered handlers run on the worker
//! thread and their result is acked asynchronously to `.rpc/status` as
//! `{"id", "statusCode", "detail"}`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use stratus_core::transport::content_format;
use stratus_core::{Client, Error, Result};

/// Path prefix for RPC traffic.
pub const RPC_PREFIX: &str = ".rpc/";

/// Status codes acked back to the caller; the numeric values are part of
/// the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    /// Success
    Ok = 0,
    /// The call was canceled
    Canceled = 1,
    /// Unclassified failure
    Unknown = 2,
    /// Malformed parameters
    InvalidArgument = 3,
    /// The handler took too long
    DeadlineExceeded = 4,
    /// The referenced entity does not exist
    NotFound = 5,
    /// The entity already exists
    AlreadyExists = 6,
    /// The caller may not do this
    PermissionDenied = 7,
    /// A resource is exhausted
    ResourceExhausted = 8,
    /// A precondition does not hold
    FailedPrecondition = 9,
    /// The call was aborted
    Aborted = 10,
    /// A value is out of range
    OutOfRange = 11,
    /// The method is not implemented
    Unimplemented = 12,
    /// Internal handler error
    Internal = 13,
    /// No handler is registered for the method
    Unavailable = 14,
    /// Data was lost or corrupted
    DataLoss = 15,
    /// The caller is not authenticated
    Unauthenticated = 16,
}

/// A registered method: receives the method name and params, returns a
/// status and optional JSON detail for the ack. Runs on the worker
/// thread and must not block.
pub type RpcHandler = Arc<dyn Fn(&str, &Value) -> (RpcStatus, Option<Value>) + Send + Sync>;

/// One parsed incoming call.
fn parse_call(payload: &[u8]) -> Option<(String, String, Value)> {
    // Anything that is clearly not JSON is ignored.
    if payload.first() != Some(&b'{') {
        return None;
    }
    let root: Value = match serde_json::from_slice(payload) {
        Ok(root) => root,
        Err(_) => {
            error!("failed to parse rpc call");
            return None;
        }
    };
    let id = root.get("id")?.as_str()?.to_string();
    let method = root.get("method")?.as_str()?.to_string();
    let params = root.get("params")?.clone();
    Some((id, method, params))
}

/// Serialize the ack for one call.
fn encode_ack(id: &str, status: RpcStatus, detail: Option<&Value>) -> Result<Vec<u8>> {
    let ack = match detail {
        Some(detail) => json!({ "id": id, "statusCode": status as i64, "detail": detail }),
        None => json!({ "id": id, "statusCode": status as i64 }),
    };
    serde_json::to_vec(&ack).map_err(|_| Error::Serialize)
}

/// RPC dispatch for one client.
pub struct Rpc {
    client: Arc<Client>,
    methods: Arc<RwLock<HashMap<String, RpcHandler>>>,
}

impl Rpc {
    /// Wrap a client.
    pub fn new(client: Arc<Client>) -> Self {
        Self {
            client,
            methods: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler for `method`.
    ///
    /// The first registration establishes the `.rpc/` observation;
    /// later ones only extend the method table. Re-registering a method
    /// replaces its handler.
    pub fn register(
        &self,
        method: &str,
        handler: impl Fn(&str, &Value) -> (RpcStatus, Option<Value>) + Send + Sync + 'static,
    ) -> Result<()> {
        let first = {
            let mut methods = self.methods.write();
            let first = methods.is_empty();
            methods.insert(method.to_string(), Arc::new(handler));
            first
        };
        if !first {
            return Ok(());
        }

        let client = self.client.clone();
        let methods = self.methods.clone();
        let observed = self.client.observe_async(
            RPC_PREFIX,
            "",
            content_format::JSON,
            Arc::new(move |_response, _path, payload: &[u8]| {
                dispatch(&client, &methods, payload);
            }),
        );
        if observed.is_err() {
            // Without the observation the table is useless; undo the
            // insert so a later register can try again.
            self.methods.write().remove(method);
        }
        observed
    }
}

/// Handle one notification: parse, run the handler, ack.
fn dispatch(client: &Client, methods: &RwLock<HashMap<String, RpcHandler>>, payload: &[u8]) {
    let Some((id, method, params)) = parse_call(payload) else {
        return;
    };
    debug!(call_id = %id, method = %method, "rpc call");

    let handler = methods.read().get(&method).cloned();
    let (status, detail) = match handler {
        Some(handler) => handler(&method, &params),
        None => {
            warn!(method = %method, "rpc method not registered");
            (RpcStatus::Unavailable, None)
        }
    };

    let ack = match encode_ack(&id, status, detail.as_ref()) {
        Ok(ack) => ack,
        Err(error) => {
            error!(%error, call_id = %id, "failed to serialize rpc ack");
            return;
        }
    };
    // The ack must not wait on the worker (we are the worker), so it is
    // submitted asynchronously.
    if let Err(error) =
        client.post_async(RPC_PREFIX, "status", content_format::JSON, &ack, None, None)
    {
        error!(%error, call_id = %id, "failed to enqueue rpc ack");
    }
}
