//! [`WasmBehaviorLoader`]: the Wasmtime-backed [`BehaviorLoader`].
//!
//! Loaded behaviors are kept by handle; instances (proxies) are kept by proxy
//! id and run once per frame in id order, so the commands of a frame come out
//! in the same order on every run.

use std::collections::BTreeMap;

use cubic_logic::behavior::{BehaviorHandle, BehaviorLoader, LoaderError, ProxyId};
use cubic_logic::entity::EntityId;
use serde::{Deserialize, Serialize};
use wasmtime::{Engine, Linker};

use crate::host_api::{register_host_api, FrameInput, HostState, TransformCommand};
use crate::module::{build_engine, BehaviorInstance, BehaviorModule, ScriptConfig};
use crate::ScriptError;

// ---------------------------------------------------------------------------
// Frame results
// ---------------------------------------------------------------------------

/// A proxy whose `update()` failed during a frame. Its commands for that
/// frame are discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyFailure {
    pub proxy: ProxyId,
    pub entity: EntityId,
    pub behavior: BehaviorHandle,
    pub error: ScriptError,
}

/// Everything produced by one [`WasmBehaviorLoader::run_frame`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameOutput {
    /// Commands in proxy-id order, then issue order.
    pub commands: Vec<TransformCommand>,
    pub failures: Vec<ProxyFailure>,
    pub fuel_consumed: u64,
    /// Proxies whose `update()` completed.
    pub proxies_run: usize,
}

// ---------------------------------------------------------------------------
// WasmBehaviorLoader
// ---------------------------------------------------------------------------

/// Compiles behavior sources and runs their per-entity instances.
pub struct WasmBehaviorLoader {
    engine: Engine,
    linker: Linker<HostState>,
    config: ScriptConfig,
    modules: BTreeMap<BehaviorHandle, BehaviorModule>,
    proxies: BTreeMap<ProxyId, BehaviorInstance>,
    next_behavior: u64,
    next_proxy: u64,
}

impl WasmBehaviorLoader {
    /// Create a loader with the `"cubic"` host API registered.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError::Runtime`] if the engine or linker cannot be built.
    pub fn new(config: ScriptConfig) -> Result<Self, ScriptError> {
        let engine = build_engine()?;
        let mut linker = Linker::new(&engine);
        register_host_api(&mut linker)
            .map_err(|e| ScriptError::Runtime(format!("failed to register host API: {e}")))?;
        Ok(Self {
            engine,
            linker,
            config,
            modules: BTreeMap::new(),
            proxies: BTreeMap::new(),
            next_behavior: 0,
            next_proxy: 0,
        })
    }

    /// Compile and register a behavior, returning its new handle.
    ///
    /// # Errors
    ///
    /// See [`BehaviorModule::compile`].
    pub fn load_module(&mut self, source: &[u8]) -> Result<BehaviorHandle, ScriptError> {
        let module = BehaviorModule::compile(&self.engine, source, &self.config)?;
        self.next_behavior += 1;
        let handle = BehaviorHandle::from_raw(self.next_behavior);
        tracing::info!(
            behavior = %handle,
            digest = %module.digest().to_hex(),
            "behavior loaded"
        );
        self.modules.insert(handle, module);
        Ok(handle)
    }

    /// Create an instance of `behavior` on `entity`.
    ///
    /// # Errors
    ///
    /// [`ScriptError::Runtime`] for an unknown handle, or any error raised
    /// while instantiating or running `start()`.
    pub fn spawn(
        &mut self,
        behavior: BehaviorHandle,
        entity: EntityId,
    ) -> Result<ProxyId, ScriptError> {
        let module = self
            .modules
            .get(&behavior)
            .ok_or_else(|| ScriptError::Runtime(format!("behavior {behavior} is not loaded")))?;
        let instance = BehaviorInstance::new(
            &self.engine,
            &self.linker,
            module,
            behavior,
            entity,
            &self.config,
        )?;
        self.next_proxy += 1;
        let proxy = ProxyId::from_raw(self.next_proxy);
        self.proxies.insert(proxy, instance);
        Ok(proxy)
    }

    /// Run `update()` on every live proxy.
    ///
    /// A failing proxy is logged and reported in
    /// [`FrameOutput::failures`]; the others still run.
    pub fn run_frame(&mut self, input: &FrameInput) -> FrameOutput {
        let mut output = FrameOutput::default();
        for (&proxy, instance) in &mut self.proxies {
            match instance.call_update(input) {
                Ok(fuel) => {
                    output.fuel_consumed += fuel;
                    output.proxies_run += 1;
                    output.commands.extend(instance.drain_commands());
                }
                Err(error) => {
                    instance.discard_commands();
                    tracing::warn!(
                        %proxy,
                        entity = %instance.entity(),
                        behavior = %instance.behavior(),
                        %error,
                        "behavior update failed"
                    );
                    output.failures.push(ProxyFailure {
                        proxy,
                        entity: instance.entity(),
                        behavior: instance.behavior(),
                        error,
                    });
                }
            }
        }
        output
    }

    /// Number of loaded behaviors.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Number of live proxies.
    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    /// Whether `behavior` is loaded.
    pub fn is_loaded(&self, behavior: BehaviorHandle) -> bool {
        self.modules.contains_key(&behavior)
    }

    /// The compiled module behind `behavior`.
    pub fn module(&self, behavior: BehaviorHandle) -> Option<&BehaviorModule> {
        self.modules.get(&behavior)
    }

    /// A live instance, for inspection.
    pub fn proxy(&self, proxy: ProxyId) -> Option<&BehaviorInstance> {
        self.proxies.get(&proxy)
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }
}

impl BehaviorLoader for WasmBehaviorLoader {
    fn compile_and_load(&mut self, source: &str) -> Result<BehaviorHandle, LoaderError> {
        self.load_module(source.as_bytes()).map_err(LoaderError::from)
    }

    fn instantiate(
        &mut self,
        behavior: BehaviorHandle,
        entity: EntityId,
    ) -> Result<ProxyId, LoaderError> {
        if !self.modules.contains_key(&behavior) {
            return Err(LoaderError::UnknownBehavior(behavior));
        }
        self.spawn(behavior, entity)
            .map_err(|e| LoaderError::Instantiate {
                behavior,
                entity,
                reason: e.to_string(),
            })
    }

    fn release(&mut self, proxy: ProxyId) {
        if let Some(instance) = self.proxies.remove(&proxy) {
            tracing::debug!(%proxy, entity = %instance.entity(), "behavior instance released");
        }
    }

    fn unload(&mut self, behavior: BehaviorHandle) -> bool {
        let removed = self.modules.remove(&behavior).is_some();
        if removed {
            let before = self.proxies.len();
            self.proxies.retain(|_, instance| instance.behavior() != behavior);
            let dropped = before - self.proxies.len();
            if dropped > 0 {
                tracing::warn!(%behavior, dropped, "unloaded behavior still had live instances");
            }
        }
        removed
    }
}

impl std::fmt::Debug for WasmBehaviorLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmBehaviorLoader")
            .field("config", &self.config)
            .field("modules", &self.modules.len())
            .field("proxies", &self.proxies.len())
            .finish_non_exhaustive()
    }
}
