//! OwnerHandler trait definition

use async_trait::async_trait;
use serde_json::Value;

use crate::hub::{CallFailure, FailureKind};

/// What a context does with the resource once it is elected owner
///
/// `on_elected` runs exactly once, after the ElectionNotice. Requests
/// forwarded meanwhile wait for it to finish. If it fails, every request
/// this context receives is answered with a `resource` failure.
#[async_trait]
pub trait OwnerHandler: Send + Sync {
    /// Privileged initialisation of the shared resource
    async fn on_elected(&self) -> eyre::Result<()> {
        Ok(())
    }

    /// Serve one routed request
    async fn handle(&self, kind: &str, payload: Value) -> Result<Value, CallFailure>;
}

/// Handler for contexts that cannot serve anything
///
/// Used when no handler is configured; if such a context is elected every
/// request fails with `no-handler`.
pub struct Unserved;

#[async_trait]
impl OwnerHandler for Unserved {
    async fn handle(&self, kind: &str, _payload: Value) -> Result<Value, CallFailure> {
        Err(CallFailure::new(
            FailureKind::NoHandler,
            format!("owner has no handler for '{}'", kind),
        ))
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Mock handler for unit tests: echoes payloads back
    #[derive(Default)]
    pub struct MockHandler {
        pub fail_init: bool,
        pub delay: Duration,
        pub inits: AtomicUsize,
        pub calls: AtomicUsize,
    }

    impl MockHandler {
        pub fn inits(&self) -> usize {
            self.inits.load(Ordering::SeqCst)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OwnerHandler for MockHandler {
        async fn on_elected(&self) -> eyre::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if self.fail_init {
                eyre::bail!("disk is read-only");
            }
            Ok(())
        }

        async fn handle(&self, kind: &str, payload: Value) -> Result<Value, CallFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match kind {
                "echo" => Ok(payload),
                other => Err(CallFailure::rejected(format!("unsupported kind '{}'", other))),
            }
        }
    }
}
