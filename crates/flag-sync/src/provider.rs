use crate::config::SyncOptions;
use crate::coordinator::SyncCoordinator;
use crate::error::SyncError;
use crate::model::{EvaluatedFlag, SyncStatus};
use async_trait::async_trait;
use open_feature::provider::{FeatureProvider, ProviderMetadata, ResolutionDetails};
use open_feature::{
    EvaluationContext, EvaluationContextFieldValue, EvaluationError, EvaluationErrorCode,
    EvaluationReason, EvaluationResult, StructValue, Value,
};
use std::sync::Arc;
use tracing::{debug, instrument};

/// OpenFeature provider answering from the synchronized flag cache.
///
/// Flags are evaluated server side for the context fixed in
/// [`SyncOptions::context`]; the per-call evaluation context is not sent.
#[derive(Debug)]
pub struct FlagSyncProvider {
    metadata: ProviderMetadata,
    sync: Arc<SyncCoordinator>,
}

impl FlagSyncProvider {
    /// Builds the coordinator, loads the flags and starts synchronizing.
    #[instrument(skip(options))]
    pub async fn new(options: SyncOptions) -> Result<Self, SyncError> {
        debug!("Initializing FlagSyncProvider with options: {:?}", options);
        let sync = SyncCoordinator::new(options)?;
        sync.initialize().await?;
        Ok(Self::with_coordinator(Arc::new(sync)))
    }

    /// Wraps a coordinator the caller initializes itself.
    pub fn with_coordinator(sync: Arc<SyncCoordinator>) -> Self {
        Self {
            metadata: ProviderMetadata::new("flag-sync"),
            sync,
        }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
    }

    async fn lookup(&self, flag_key: &str) -> EvaluationResult<(EvaluatedFlag, bool)> {
        match self.sync.status() {
            SyncStatus::NotReady => {
                return Err(EvaluationError {
                    code: EvaluationErrorCode::ProviderNotReady,
                    message: Some("Flags have not been loaded".to_string()),
                });
            }
            SyncStatus::Error => {
                return Err(EvaluationError {
                    code: EvaluationErrorCode::General("provider failed to initialize".to_string()),
                    message: Some("Flags could not be loaded".to_string()),
                });
            }
            SyncStatus::Ready | SyncStatus::Stale => {}
        }

        let flag = self.sync.get_or_refresh(flag_key).await.ok_or_else(|| {
            debug!("Flag not in cache");
            EvaluationError {
                code: EvaluationErrorCode::FlagNotFound,
                message: Some(format!("Flag: {} not found", flag_key)),
            }
        })?;
        Ok((flag, self.sync.status() == SyncStatus::Stale))
    }
}

fn type_mismatch(flag_key: &str, expected: &str) -> EvaluationError {
    EvaluationError {
        code: EvaluationErrorCode::TypeMismatch,
        message: Some(format!("Flag: {} is not a {}", flag_key, expected)),
    }
}

fn details<T>(value: T, flag: EvaluatedFlag, stale: bool) -> ResolutionDetails<T> {
    let reason = if stale {
        Some(EvaluationReason::Cached)
    } else {
        flag.reason.as_deref().map(parse_reason)
    };
    debug!(variant = ?flag.variant, ?reason, "Flag evaluated");
    ResolutionDetails {
        value,
        variant: flag.variant,
        reason,
        flag_metadata: Default::default(),
    }
}

fn parse_reason(reason: &str) -> EvaluationReason {
    match reason {
        "STATIC" => EvaluationReason::Static,
        "DEFAULT" => EvaluationReason::Default,
        "TARGETING_MATCH" => EvaluationReason::TargetingMatch,
        "SPLIT" => EvaluationReason::Split,
        "CACHED" => EvaluationReason::Cached,
        "DISABLED" => EvaluationReason::Disabled,
        "UNKNOWN" => EvaluationReason::Unknown,
        "ERROR" => EvaluationReason::Error,
        other => EvaluationReason::Other(other.to_string()),
    }
}

#[async_trait]
impl FeatureProvider for FlagSyncProvider {
    fn metadata(&self) -> &ProviderMetadata {
        &self.metadata
    }

    #[instrument(skip(self, _evaluation_context), fields(flag_key = %flag_key))]
    async fn resolve_bool_value(
        &self,
        flag_key: &str,
        _evaluation_context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<bool>> {
        let (flag, stale) = self.lookup(flag_key).await?;
        let value = flag
            .value
            .as_bool()
            .ok_or_else(|| type_mismatch(flag_key, "boolean"))?;
        Ok(details(value, flag, stale))
    }

    #[instrument(skip(self, _evaluation_context), fields(flag_key = %flag_key))]
    async fn resolve_string_value(
        &self,
        flag_key: &str,
        _evaluation_context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<String>> {
        let (flag, stale) = self.lookup(flag_key).await?;
        let value = flag
            .value
            .as_str()
            .ok_or_else(|| type_mismatch(flag_key, "string"))?
            .to_string();
        Ok(details(value, flag, stale))
    }

    #[instrument(skip(self, _evaluation_context), fields(flag_key = %flag_key))]
    async fn resolve_float_value(
        &self,
        flag_key: &str,
        _evaluation_context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<f64>> {
        let (flag, stale) = self.lookup(flag_key).await?;
        let value = flag
            .value
            .as_f64()
            .ok_or_else(|| type_mismatch(flag_key, "number"))?;
        Ok(details(value, flag, stale))
    }

    #[instrument(skip(self, _evaluation_context), fields(flag_key = %flag_key))]
    async fn resolve_int_value(
        &self,
        flag_key: &str,
        _evaluation_context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<i64>> {
        let (flag, stale) = self.lookup(flag_key).await?;
        let value = flag
            .value
            .as_i64()
            .ok_or_else(|| type_mismatch(flag_key, "integer"))?;
        Ok(details(value, flag, stale))
    }

    #[instrument(skip(self, _evaluation_context), fields(flag_key = %flag_key))]
    async fn resolve_struct_value(
        &self,
        flag_key: &str,
        _evaluation_context: &EvaluationContext,
    ) -> EvaluationResult<ResolutionDetails<StructValue>> {
        let (flag, stale) = self.lookup(flag_key).await?;
        let value = flag
            .value
            .clone()
            .into_feature_value()
            .as_struct()
            .ok_or_else(|| type_mismatch(flag_key, "struct"))?
            .clone();
        Ok(details(value, flag, stale))
    }
}

/// Converts an OpenFeature context into the JSON object posted to the
/// evaluation endpoint.
pub fn context_to_json(context: &EvaluationContext) -> serde_json::Value {
    let mut fields = serde_json::Map::new();

    if let Some(targeting_key) = &context.targeting_key {
        fields.insert(
            "targetingKey".to_string(),
            serde_json::Value::String(targeting_key.clone()),
        );
    }

    for (key, value) in &context.custom_fields {
        let json_value = match value {
            EvaluationContextFieldValue::String(s) => serde_json::Value::String(s.clone()),
            EvaluationContextFieldValue::Bool(b) => serde_json::Value::Bool(*b),
            EvaluationContextFieldValue::Int(i) => serde_json::Value::Number((*i).into()),
            EvaluationContextFieldValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            EvaluationContextFieldValue::DateTime(dt) => serde_json::Value::String(dt.to_string()),
            EvaluationContextFieldValue::Struct(s) => serde_json::Value::String(format!("{:?}", s)),
        };
        fields.insert(key.clone(), json_value);
    }

    serde_json::Value::Object(fields)
}

trait IntoFeatureValue {
    fn into_feature_value(self) -> Value;
}

impl IntoFeatureValue for serde_json::Value {
    fn into_feature_value(self) -> Value {
        match self {
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(|v| v.into_feature_value()).collect())
            }
            serde_json::Value::Object(obj) => {
                let mut struct_value = StructValue::default();
                for (k, v) in obj {
                    struct_value.add_field(k, v.into_feature_value());
                }
                Value::Struct(struct_value)
            }
            serde_json::Value::Null => Value::String(String::new()),
        }
    }
}
