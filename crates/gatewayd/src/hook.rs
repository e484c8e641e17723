//! Lifecycle hook registry
//!
//! Hooks are named lifecycle points at which plugins observe or mutate a
//! structured payload. Handlers are ranked by priority (lower runs first)
//! and chained: each handler sees the previous handler's output. The
//! configured [`VerificationPolicy`] decides what happens when a handler
//! returns a payload that no longer carries the original keys, errors out,
//! or exceeds the plugin timeout.

use crate::metrics;
use crate::payload;
use async_trait::async_trait;
use gatewayd_common::config::VerificationPolicy;
use gatewayd_common::error::{ErrorKind, GatewayError, Result};
use parking_lot::RwLock;
use prost_types::value::Kind;
use prost_types::{Struct, Value as PbValue};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Hook names recognized by the gateway
pub mod hookname {
    pub const ON_CONFIG_LOADED: &str = "OnConfigLoaded";
    pub const ON_NEW_POOL: &str = "OnNewPool";
    pub const ON_NEW_PROXY: &str = "OnNewProxy";
    pub const ON_NEW_SERVER: &str = "OnNewServer";
    pub const ON_RUN: &str = "OnRun";
    pub const ON_SIGNAL: &str = "OnSignal";
    pub const ON_BOOTING: &str = "OnBooting";
    pub const ON_BOOTED: &str = "OnBooted";
    pub const ON_OPENING: &str = "OnOpening";
    pub const ON_OPENED: &str = "OnOpened";
    pub const ON_TRAFFIC: &str = "OnTraffic";
    pub const ON_INGRESS_TRAFFIC: &str = "OnIngressTraffic";
    pub const ON_EGRESS_TRAFFIC: &str = "OnEgressTraffic";
    pub const ON_CLOSING: &str = "OnClosing";
    pub const ON_CLOSED: &str = "OnClosed";
    pub const ON_SHUTDOWN: &str = "OnShutdown";
    pub const ON_TICK: &str = "OnTick";
}

/// A single hook handler, usually a plugin RPC dispatch
#[async_trait]
pub trait HookMethod: Send + Sync {
    async fn call(&self, params: Struct) -> Result<Struct>;
}

/// True when a hook result asks for the connection to be closed
pub fn terminates(result: &Value) -> bool {
    result
        .get("terminate")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Priority-ordered per-hook handler chains
pub struct HookRegistry {
    hooks: RwLock<HashMap<String, BTreeMap<i32, Arc<dyn HookMethod>>>>,
    verification: VerificationPolicy,
    plugin_timeout: Duration,
}

impl HookRegistry {
    pub fn new(verification: VerificationPolicy, plugin_timeout: Duration) -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
            verification,
            plugin_timeout,
        }
    }

    /// The configured verification policy
    pub fn verification(&self) -> VerificationPolicy {
        self.verification
    }

    /// Register a handler. A second handler at the same (name, priority)
    /// replaces the first and logs a warning.
    pub fn add(&self, hook_name: &str, priority: i32, method: Arc<dyn HookMethod>) {
        let mut hooks = self.hooks.write();
        let chain = hooks.entry(hook_name.to_string()).or_default();
        if chain.insert(priority, method).is_some() {
            warn!(hook = hook_name, priority, "hook is replaced");
        }
        metrics::PLUGIN_HOOKS_REGISTERED.inc();
    }

    /// Number of handlers registered for a hook
    pub fn count(&self, hook_name: &str) -> usize {
        self.hooks
            .read()
            .get(hook_name)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Run the handler chain for `hook_name`, passing each handler the
    /// previous handler's output.
    ///
    /// `args` must be a JSON object with primitive-typed values; it is cast
    /// to the structured-value wire form once, up front. Handlers whose
    /// output drops or retypes an original key, error out, or time out are
    /// handled per the verification policy. Cancelling `ctx` short-circuits
    /// the rest of the chain and returns the current payload.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        hook_name: &str,
        args: Value,
    ) -> Result<Value> {
        let Value::Object(args_map) = args else {
            return Err(GatewayError::new(ErrorKind::CastFailed)
                .with_message("hook arguments must be an object"));
        };
        if ctx.is_cancelled() {
            return Ok(Value::Object(args_map));
        }

        let params = payload::to_struct(&args_map);

        // Snapshot the chain so registry mutations only affect later runs.
        let chain: Vec<(i32, Arc<dyn HookMethod>)> = self
            .hooks
            .read()
            .get(hook_name)
            .map(|m| m.iter().map(|(p, h)| (*p, h.clone())).collect())
            .unwrap_or_default();
        if chain.is_empty() {
            return Ok(Value::Object(args_map));
        }

        let mut carry = params.clone();
        let mut remove_list: Vec<i32> = Vec::new();

        for (idx, (priority, method)) in chain.iter().enumerate() {
            metrics::PLUGIN_HOOKS_EXECUTED.inc();

            let outcome = tokio::select! {
                _ = ctx.cancelled() => {
                    // Shutdown in flight: stop here with whatever we have.
                    return Ok(Value::Object(payload::from_struct(&carry)));
                }
                res = timeout(self.plugin_timeout, method.call(carry.clone())) => res,
            };

            let result = match outcome {
                Ok(Ok(result)) => Some(result),
                Ok(Err(err)) => {
                    warn!(hook = hook_name, priority, error = %err, "hook call failed");
                    None
                }
                Err(_) => {
                    warn!(hook = hook_name, priority, "hook call timed out");
                    None
                }
            };

            // Verification always runs against the original arguments; under
            // PassDown a returned payload is accepted as-is.
            if let Some(result) = result {
                if self.verification == VerificationPolicy::PassDown || verify(&params, &result) {
                    carry = result;
                    continue;
                }
            }

            match self.verification {
                VerificationPolicy::Ignore | VerificationPolicy::PassDown => {
                    error!(
                        hook = hook_name,
                        priority, "hook returned invalid value, ignoring"
                    );
                }
                VerificationPolicy::Abort => {
                    error!(
                        hook = hook_name,
                        priority, "hook returned invalid value, aborting"
                    );
                    if idx == 0 {
                        return Ok(Value::Object(args_map));
                    }
                    return Ok(Value::Object(payload::from_struct(&carry)));
                }
                VerificationPolicy::Remove => {
                    error!(
                        hook = hook_name,
                        priority, "hook returned invalid value, removing"
                    );
                    remove_list.push(*priority);
                }
            }
        }

        if !remove_list.is_empty() {
            let mut hooks = self.hooks.write();
            if let Some(chain) = hooks.get_mut(hook_name) {
                for priority in remove_list {
                    chain.remove(&priority);
                }
            }
        }

        Ok(Value::Object(payload::from_struct(&carry)))
    }
}

/// Check that every top-level key in `expected` is still present in
/// `actual` with a compatible type. Extra keys in `actual` are permitted.
pub fn verify(expected: &Struct, actual: &Struct) -> bool {
    expected.fields.iter().all(|(key, expected_value)| {
        actual
            .fields
            .get(key)
            .is_some_and(|actual_value| value_compatible(expected_value, actual_value))
    })
}

/// Structural subtyping over structured values: numbers are one widened
/// type, lists must match the expected element type when the expected list
/// is non-empty, dicts recurse, and an expected null matches anything.
fn value_compatible(expected: &PbValue, actual: &PbValue) -> bool {
    match (&expected.kind, &actual.kind) {
        (None, _) | (Some(Kind::NullValue(_)), _) => true,
        (Some(Kind::BoolValue(_)), Some(Kind::BoolValue(_))) => true,
        (Some(Kind::NumberValue(_)), Some(Kind::NumberValue(_))) => true,
        (Some(Kind::StringValue(_)), Some(Kind::StringValue(_))) => true,
        (Some(Kind::ListValue(expected_list)), Some(Kind::ListValue(actual_list))) => {
            match expected_list.values.first() {
                Some(prototype) => actual_list
                    .values
                    .iter()
                    .all(|v| value_compatible(prototype, v)),
                None => true,
            }
        }
        (Some(Kind::StructValue(expected_fields)), Some(Kind::StructValue(actual_fields))) => {
            verify(expected_fields, actual_fields)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Handler that merges fixed fields into the payload it receives
    struct MergeHook {
        fields: Value,
        calls: Arc<parking_lot::Mutex<Vec<i32>>>,
        tag: i32,
    }

    #[async_trait]
    impl HookMethod for MergeHook {
        async fn call(&self, params: Struct) -> Result<Struct> {
            self.calls.lock().push(self.tag);
            let mut fields = payload::from_struct(&params);
            if let Value::Object(extra) = &self.fields {
                for (k, v) in extra {
                    fields.insert(k.clone(), v.clone());
                }
            }
            Ok(payload::to_struct(&fields))
        }
    }

    /// Handler that drops every original key
    struct DropAllHook {
        calls: Arc<parking_lot::Mutex<Vec<i32>>>,
        tag: i32,
    }

    #[async_trait]
    impl HookMethod for DropAllHook {
        async fn call(&self, _params: Struct) -> Result<Struct> {
            self.calls.lock().push(self.tag);
            Ok(Struct::default())
        }
    }

    /// Handler that never finishes in time
    struct SlowHook;

    #[async_trait]
    impl HookMethod for SlowHook {
        async fn call(&self, params: Struct) -> Result<Struct> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(params)
        }
    }

    fn registry(policy: VerificationPolicy) -> HookRegistry {
        HookRegistry::new(policy, Duration::from_millis(200))
    }

    fn calls() -> Arc<parking_lot::Mutex<Vec<i32>>> {
        Arc::new(parking_lot::Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_empty_chain_returns_args_unchanged() {
        let registry = registry(VerificationPolicy::PassDown);
        let args = json!({ "client": { "local": "l", "remote": "r" }, "count": 3 });
        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", args.clone())
            .await
            .unwrap();
        assert_eq!(result, args);
    }

    #[tokio::test]
    async fn test_chain_runs_in_priority_order() {
        let registry = registry(VerificationPolicy::PassDown);
        let seen = calls();
        registry.add(
            "OnTraffic",
            20,
            Arc::new(MergeHook {
                fields: json!({ "second": true }),
                calls: seen.clone(),
                tag: 20,
            }),
        );
        registry.add(
            "OnTraffic",
            10,
            Arc::new(MergeHook {
                fields: json!({ "first": true }),
                calls: seen.clone(),
                tag: 10,
            }),
        );

        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", json!({ "base": 1 }))
            .await
            .unwrap();

        assert_eq!(*seen.lock(), vec![10, 20]);
        assert_eq!(result["base"], json!(1));
        assert_eq!(result["first"], json!(true));
        assert_eq!(result["second"], json!(true));
    }

    #[tokio::test]
    async fn test_abort_returns_original_args_and_skips_rest() {
        let registry = registry(VerificationPolicy::Abort);
        let seen = calls();
        registry.add(
            "OnTraffic",
            10,
            Arc::new(DropAllHook {
                calls: seen.clone(),
                tag: 10,
            }),
        );
        registry.add(
            "OnTraffic",
            20,
            Arc::new(MergeHook {
                fields: json!({ "ran": true }),
                calls: seen.clone(),
                tag: 20,
            }),
        );

        let args = json!({ "keep": "me" });
        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", args.clone())
            .await
            .unwrap();

        assert_eq!(result, args);
        // The second handler is never invoked.
        assert_eq!(*seen.lock(), vec![10]);
    }

    #[tokio::test]
    async fn test_remove_evicts_the_failing_handler() {
        let registry = registry(VerificationPolicy::Remove);
        let seen = calls();
        registry.add(
            "OnTraffic",
            10,
            Arc::new(DropAllHook {
                calls: seen.clone(),
                tag: 10,
            }),
        );
        registry.add(
            "OnTraffic",
            20,
            Arc::new(MergeHook {
                fields: json!({ "ran": true }),
                calls: seen.clone(),
                tag: 20,
            }),
        );

        let args = json!({ "keep": "me" });
        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", args.clone())
            .await
            .unwrap();
        assert_eq!(result["keep"], json!("me"));
        assert_eq!(result["ran"], json!(true));
        assert_eq!(registry.count("OnTraffic"), 1);

        // A second run only invokes the surviving handler.
        seen.lock().clear();
        registry
            .run(&CancellationToken::new(), "OnTraffic", args)
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec![20]);
    }

    #[tokio::test]
    async fn test_ignore_keeps_previous_carry() {
        let registry = registry(VerificationPolicy::Ignore);
        let seen = calls();
        registry.add(
            "OnTraffic",
            10,
            Arc::new(MergeHook {
                fields: json!({ "first": 1 }),
                calls: seen.clone(),
                tag: 10,
            }),
        );
        registry.add(
            "OnTraffic",
            20,
            Arc::new(DropAllHook {
                calls: seen.clone(),
                tag: 20,
            }),
        );
        registry.add(
            "OnTraffic",
            30,
            Arc::new(MergeHook {
                fields: json!({ "third": 3 }),
                calls: seen.clone(),
                tag: 30,
            }),
        );

        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", json!({ "base": 0 }))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec![10, 20, 30]);
        assert_eq!(result["base"], json!(0));
        assert_eq!(result["first"], json!(1));
        assert_eq!(result["third"], json!(3));
    }

    #[tokio::test]
    async fn test_pass_down_accepts_arbitrary_output() {
        let registry = registry(VerificationPolicy::PassDown);
        let seen = calls();
        registry.add(
            "OnTraffic",
            10,
            Arc::new(DropAllHook {
                calls: seen.clone(),
                tag: 10,
            }),
        );

        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", json!({ "base": 0 }))
            .await
            .unwrap();
        // The permissive policy passes the handler output through even
        // though it dropped every original key.
        assert_eq!(result, json!({}));
    }

    #[tokio::test]
    async fn test_cancelled_context_invokes_nothing() {
        let registry = registry(VerificationPolicy::PassDown);
        let seen = calls();
        registry.add(
            "OnTraffic",
            10,
            Arc::new(MergeHook {
                fields: json!({ "ran": true }),
                calls: seen.clone(),
                tag: 10,
            }),
        );

        let ctx = CancellationToken::new();
        ctx.cancel();
        let args = json!({ "base": 0 });
        let result = registry.run(&ctx, "OnTraffic", args.clone()).await.unwrap();
        assert_eq!(result, args);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_is_a_verification_failure() {
        let registry = registry(VerificationPolicy::Abort);
        registry.add("OnTraffic", 10, Arc::new(SlowHook));

        let args = json!({ "base": 0 });
        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", args.clone())
            .await
            .unwrap();
        assert_eq!(result, args);
    }

    #[tokio::test]
    async fn test_same_priority_replaces() {
        let registry = registry(VerificationPolicy::PassDown);
        let seen = calls();
        registry.add(
            "OnTraffic",
            10,
            Arc::new(MergeHook {
                fields: json!({ "old": true }),
                calls: seen.clone(),
                tag: 1,
            }),
        );
        registry.add(
            "OnTraffic",
            10,
            Arc::new(MergeHook {
                fields: json!({ "new": true }),
                calls: seen.clone(),
                tag: 2,
            }),
        );
        assert_eq!(registry.count("OnTraffic"), 1);

        let result = registry
            .run(&CancellationToken::new(), "OnTraffic", json!({}))
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec![2]);
        assert_eq!(result, json!({ "new": true }));
    }

    #[tokio::test]
    async fn test_non_object_args_fail_cast() {
        let registry = registry(VerificationPolicy::PassDown);
        let err = registry
            .run(&CancellationToken::new(), "OnTraffic", json!([1, 2]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CastFailed);
    }

    #[test]
    fn test_verify_subtyping() {
        let expected = payload::to_struct(
            json!({
                "n": 1, "s": "x", "b": true, "nil": null,
                "list": [1, 2], "dict": { "inner": "v" }
            })
            .as_object()
            .unwrap(),
        );

        // Same shape with extra keys passes.
        let actual = payload::to_struct(
            json!({
                "n": 2.5, "s": "y", "b": false, "nil": "filled",
                "list": [3], "dict": { "inner": "w", "extra": 1 },
                "unrelated": true
            })
            .as_object()
            .unwrap(),
        );
        assert!(verify(&expected, &actual));

        // Missing key fails.
        let actual = payload::to_struct(json!({ "n": 1 }).as_object().unwrap());
        assert!(!verify(&expected, &actual));

        // Retyped key fails.
        let actual = payload::to_struct(
            json!({
                "n": "not-a-number", "s": "y", "b": false, "nil": null,
                "list": [1], "dict": { "inner": "v" }
            })
            .as_object()
            .unwrap(),
        );
        assert!(!verify(&expected, &actual));

        // Wrong list element type fails.
        let actual = payload::to_struct(
            json!({
                "n": 1, "s": "y", "b": false, "nil": null,
                "list": ["str"], "dict": { "inner": "v" }
            })
            .as_object()
            .unwrap(),
        );
        assert!(!verify(&expected, &actual));
    }

    #[test]
    fn test_terminates() {
        assert!(terminates(&json!({ "terminate": true })));
        assert!(!terminates(&json!({ "terminate": false })));
        assert!(!terminates(&json!({ "terminate": "yes" })));
        assert!(!terminates(&json!({})));
    }
}
