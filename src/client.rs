//! The stateful protocol object (spec §4.3): wraps one [`ProcessTransport`],
//! performs the `initialize` handshake, and exposes the typed MCP
//! operations a caller actually wants — tool listing/invocation and
//! resource listing/reading.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{ClientError, InitFailure};
use crate::protocol::{
    self, ClientInfo, InitializeResult, ReadResourceResult, ResourceDef, ResourcesListResult,
    ServerInfo, ToolCallResult, ToolDef, ToolsListResult,
};
use crate::transport::ProcessTransport;

/// MCP protocol version this client's `initialize` advertises by default.
/// Spec §4.3: the reference client hardcodes `"2024-11-05"`, but it is a
/// parameter, not a constant, everywhere below.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

pub struct Client {
    transport: ProcessTransport,
    protocol_version: String,
    client_info: ClientInfo,
    initialized: AtomicBool,
    removed: AtomicBool,
    server_info: RwLock<Option<ServerInfo>>,
}

impl Client {
    pub fn new(transport: ProcessTransport, client_info: ClientInfo) -> Self {
        Self::with_protocol_version(transport, client_info, DEFAULT_PROTOCOL_VERSION)
    }

    pub fn with_protocol_version(
        transport: ProcessTransport,
        client_info: ClientInfo,
        protocol_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            protocol_version: protocol_version.into(),
            client_info,
            initialized: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            server_info: RwLock::new(None),
        }
    }

    pub fn transport(&self) -> &ProcessTransport {
        &self.transport
    }

    /// Perform the `initialize` handshake. On success, remembers the
    /// server-advertised name/version (if any) and marks the client ready
    /// to accept other operations.
    pub async fn initialize(&self) -> Result<(), ClientError> {
        let params = protocol::initialize_params(self.protocol_version.clone(), self.client_info.clone());
        let params_value =
            serde_json::to_value(&params).expect("InitializeParams always serializes");

        let resp = self
            .transport
            .send_request("initialize", Some(params_value))
            .await
            .map_err(|e| {
                self.initialized.store(false, Ordering::SeqCst);
                ClientError::InitFailed(InitFailure::Transport(e))
            })?;

        if let Some(err) = resp.error {
            self.initialized.store(false, Ordering::SeqCst);
            return Err(ClientError::InitFailed(InitFailure::Remote(err.into())));
        }

        let result: InitializeResult = serde_json::from_value(resp.result.unwrap_or(Value::Null))
            .unwrap_or_default();
        *self.server_info.write().await = result.server_info;

        // Best-effort: MCP servers expect this notification after a
        // successful initialize; failure here does not unwind the handshake
        // since the client is already usable without it.
        if let Err(e) = self
            .transport
            .send_notification("notifications/initialized", None)
            .await
        {
            tracing::debug!(error = %e, "failed to send notifications/initialized");
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<ToolDef>, ClientError> {
        let resp = self.call("tools/list", None).await?;
        let result: ToolsListResult = serde_json::from_value(resp).map_err(|source| ClientError::Decode {
            method: "tools/list",
            source,
        })?;
        Ok(result.tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<ToolCallResult, ClientError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| serde_json::json!({})),
        });
        let resp = self.call("tools/call", Some(params)).await?;
        serde_json::from_value(resp).map_err(|source| ClientError::Decode {
            method: "tools/call",
            source,
        })
    }

    pub async fn list_resources(&self) -> Result<Vec<ResourceDef>, ClientError> {
        let resp = self.call("resources/list", None).await?;
        let result: ResourcesListResult = serde_json::from_value(resp).map_err(|source| ClientError::Decode {
            method: "resources/list",
            source,
        })?;
        Ok(result.resources)
    }

    /// Returns the `text` of the first content entry. Fails with
    /// `BadResourceShape` if `contents` is absent/empty or the first entry
    /// has no `text`.
    pub async fn read_resource(&self, uri: &str) -> Result<String, ClientError> {
        let params = serde_json::json!({ "uri": uri });
        let resp = self.call("resources/read", Some(params)).await?;
        let result: ReadResourceResult = serde_json::from_value(resp).map_err(|source| ClientError::Decode {
            method: "resources/read",
            source,
        })?;
        result
            .contents
            .into_iter()
            .next()
            .and_then(|c| c.text)
            .ok_or(ClientError::BadResourceShape)
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await && self.initialized.load(Ordering::SeqCst)
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().await.clone()
    }

    pub async fn close(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        *self.server_info.write().await = None;
        self.transport.close().await;
    }

    /// Forces the client out of the initialized state without closing its
    /// transport. Used when the owning pool observes a failure out of band
    /// (a failed health probe) and drives the entry to `ERROR`: the
    /// transport may still be alive, but spec §7 requires subsequent calls
    /// to fail fast with `NotInitialized` rather than keep being served.
    pub async fn mark_uninitialized(&self) {
        self.initialized.store(false, Ordering::SeqCst);
    }

    /// Marks this client as removed from its owning pool, then closes it.
    /// Distinct from a plain [`Client::close`]: every call already in
    /// flight or issued concurrently with removal surfaces
    /// [`ClientError::ServerRemoved`] instead of a generic transport-closed
    /// error (spec §4.4: "concurrent operations on that client fail with
    /// `ClientError{ServerRemoved}`").
    pub async fn mark_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
        self.close().await;
    }

    /// Shared plumbing for every typed method: checks `removed`/
    /// `initialized`, issues the request, and surfaces a JSON-RPC error
    /// response as [`ClientError::Remote`] (never as data — only
    /// `tools/call`'s `isError` field is data, and that distinction is made
    /// by the caller after decoding, not here).
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(ClientError::ServerRemoved);
        }
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(ClientError::NotInitialized);
        }
        let resp = self.transport.send_request(method, params).await.map_err(|e| {
            if self.removed.load(Ordering::SeqCst) {
                ClientError::ServerRemoved
            } else {
                ClientError::Transport(e)
            }
        })?;
        if let Some(err) = resp.error {
            return Err(ClientError::Remote(err.into()));
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }
}
