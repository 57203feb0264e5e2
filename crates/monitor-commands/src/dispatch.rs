//! Capability-checked routing of unified commands onto backend adapters.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::backend::{
    BackendAdapter, CommandError, CommandResult, FeatureAvailability, UnavailableReason,
};
use crate::command::{CommandKind, Provider, UnifiedCommand};

/// The `{ok, result|error}` shape every dispatch resolves to.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl CommandEnvelope {
    pub fn success(result: CommandResult) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: CommandError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Default)]
pub struct CommandDispatcher {
    adapters: Vec<Arc<dyn BackendAdapter>>,
}

impl CommandDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.adapters.push(adapter);
    }

    fn adapter_for(&self, provider: Provider) -> Option<&Arc<dyn BackendAdapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.provider() == provider)
    }

    /// Capability × provider → availability, computed fresh from each
    /// adapter's live state on every call.
    pub fn feature_matrix(&self) -> BTreeMap<Provider, BTreeMap<CommandKind, FeatureAvailability>> {
        self.adapters
            .iter()
            .map(|adapter| {
                let row = CommandKind::ALL
                    .into_iter()
                    .map(|kind| (kind, adapter.availability(kind)))
                    .collect();
                (adapter.provider(), row)
            })
            .collect()
    }

    pub async fn dispatch(&self, command: UnifiedCommand) -> CommandEnvelope {
        let kind = command.kind();
        let provider = command.provider();

        let Some(adapter) = self.adapter_for(provider) else {
            return CommandEnvelope::failure(unavailable_error(
                provider,
                kind,
                UnavailableReason::ProviderDisabled,
            ));
        };

        match adapter.availability(kind) {
            FeatureAvailability::Unavailable { reason } => {
                tracing::debug!(
                    provider = provider.as_str(),
                    kind = kind.as_str(),
                    reason = reason.as_str(),
                    "command rejected by capability matrix"
                );
                CommandEnvelope::failure(unavailable_error(provider, kind, reason))
            }
            FeatureAvailability::Available => match adapter.execute(command).await {
                Ok(result) => CommandEnvelope::success(result),
                Err(error) => CommandEnvelope::failure(error),
            },
        }
    }
}

fn unavailable_error(
    provider: Provider,
    kind: CommandKind,
    reason: UnavailableReason,
) -> CommandError {
    CommandError::with_details(
        "backendFeatureUnavailable",
        format!(
            "{} is not available on provider {}: {}",
            kind.as_str(),
            provider.as_str(),
            reason.as_str()
        ),
        json!({
            "provider": provider,
            "kind": kind,
            "reason": reason,
        }),
    )
}
