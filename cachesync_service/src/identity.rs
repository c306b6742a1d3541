use std::fmt::Display;
use std::sync::Arc;

use uuid::Uuid;

/// Identifies one running server process in the farm.
///
/// Every record a process appends carries its identity, and the process skips its own records
/// when catching up since it applied them before appending. The process id and a random UUID
/// keep two processes apart even when they run on the same host with the same name, e.g. the
/// old and new process during a restart.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalIdentity(Arc<str>);

impl LocalIdentity {
    /// A fresh identity for this process: `{server_name}/P{pid} [{uuid}]`.
    pub fn new(server_name: &str) -> Self {
        Self(
            format!(
                "{server_name}/P{pid} [{uuid}]",
                pid = std::process::id(),
                uuid = Uuid::new_v4()
            )
            .into(),
        )
    }

    /// Use `identity` as is.
    pub fn from_raw(identity: impl Into<Arc<str>>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_arc(&self) -> Arc<str> {
        Arc::clone(&self.0)
    }
}

impl Display for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
