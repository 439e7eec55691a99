//! Behavior module compilation, validation, and per-entity execution.
//!
//! [`BehaviorModule`] is a compiled, validated behavior that is shared by
//! every entity it runs on. [`BehaviorInstance`] is one running copy of it,
//! bound to a single entity, with its own store, fuel budget and memory.

use cubic_logic::behavior::BehaviorHandle;
use cubic_logic::entity::EntityId;
use wasmtime::{Engine, ExternType, Linker, Module, Store, TypedFunc};

use crate::host_api::{FrameInput, HostState, TransformCommand};
use crate::ScriptError;

/// Export every behavior must provide.
pub const UPDATE_EXPORT: &str = "update";

/// Optional export run once when an instance is created.
pub const START_EXPORT: &str = "start";

const WASM_PAGE_BYTES: u64 = 64 * 1024;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sandbox limits applied to every behavior instance.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Fuel units granted per `start()` or `update()` call. When fuel runs
    /// out, the call traps with [`ScriptError::OutOfFuel`]. Default: 1,000,000.
    pub fuel_per_call: u64,

    /// Maximum linear memory an instance may allocate, in bytes.
    /// Default: 16 MiB.
    pub memory_limit_bytes: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            fuel_per_call: 1_000_000,
            memory_limit_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Build a Wasmtime engine with fuel metering enabled.
pub(crate) fn build_engine() -> Result<Engine, ScriptError> {
    let mut engine_config = wasmtime::Config::new();
    engine_config.consume_fuel(true);
    Engine::new(&engine_config)
        .map_err(|e| ScriptError::Runtime(format!("failed to create Wasmtime engine: {e}")))
}

// ---------------------------------------------------------------------------
// BehaviorModule
// ---------------------------------------------------------------------------

/// A compiled behavior, validated and ready to be instantiated.
///
/// The content digest identifies the source independently of the handle it
/// was loaded under.
#[derive(Clone)]
pub struct BehaviorModule {
    module: Module,
    digest: blake3::Hash,
    has_start: bool,
}

impl BehaviorModule {
    /// Compile behavior source. Accepts WebAssembly text or binary.
    ///
    /// # Validation
    ///
    /// - The source must compile.
    /// - `update` must be exported as a function.
    /// - An exported memory must not start above the configured limit.
    ///
    /// # Errors
    ///
    /// - [`ScriptError::Compile`] for invalid source.
    /// - [`ScriptError::MissingExport`] when `update` is absent.
    /// - [`ScriptError::MemoryLimitExceeded`] when the initial memory is too large.
    pub fn compile(
        engine: &Engine,
        source: &[u8],
        config: &ScriptConfig,
    ) -> Result<Self, ScriptError> {
        let module = Module::new(engine, source).map_err(|e| ScriptError::Compile(format!("{e}")))?;

        let mut has_update = false;
        let mut has_start = false;
        for export in module.exports() {
            match (export.name(), export.ty()) {
                (UPDATE_EXPORT, ExternType::Func(_)) => has_update = true,
                (START_EXPORT, ExternType::Func(_)) => has_start = true,
                (_, ExternType::Memory(memory)) => {
                    let initial = memory.minimum().saturating_mul(WASM_PAGE_BYTES);
                    if initial > config.memory_limit_bytes as u64 {
                        return Err(ScriptError::MemoryLimitExceeded {
                            limit_bytes: config.memory_limit_bytes,
                        });
                    }
                }
                _ => {}
            }
        }
        if !has_update {
            return Err(ScriptError::MissingExport {
                name: UPDATE_EXPORT.to_owned(),
            });
        }

        Ok(Self {
            module,
            digest: blake3::hash(source),
            has_start,
        })
    }

    /// Content digest of the source this module was compiled from.
    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    /// Whether the module exports `start`.
    pub fn has_start(&self) -> bool {
        self.has_start
    }

    /// Seed for an instance on `entity`: the same source on the same entity
    /// always draws the same random stream.
    fn seed_for(&self, entity: EntityId) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.digest.as_bytes());
        hasher.update(&entity.to_raw().to_le_bytes());
        let hash = hasher.finalize();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(seed)
    }
}

impl std::fmt::Debug for BehaviorModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorModule")
            .field("digest", &self.digest.to_hex().as_str())
            .field("has_start", &self.has_start)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// BehaviorInstance
// ---------------------------------------------------------------------------

/// One running copy of a behavior, bound to one entity.
///
/// # Sandbox Guarantees
///
/// - No WASI: only the `"cubic"` host API can be imported
/// - Fuel metering on every call prevents infinite loops
/// - Memory growth is capped at [`ScriptConfig::memory_limit_bytes`]
///   (`memory.grow` past the cap returns -1)
pub struct BehaviorInstance {
    store: Store<HostState>,
    update: TypedFunc<(), ()>,
    config: ScriptConfig,
}

impl BehaviorInstance {
    /// Instantiate `module` for `entity` and run its `start` export if any.
    ///
    /// # Errors
    ///
    /// - [`ScriptError::Runtime`] if instantiation fails (e.g. unsatisfied imports).
    /// - [`ScriptError::OutOfFuel`] or [`ScriptError::Trap`] if `start` fails.
    pub fn new(
        engine: &Engine,
        linker: &Linker<HostState>,
        module: &BehaviorModule,
        behavior: BehaviorHandle,
        entity: EntityId,
        config: &ScriptConfig,
    ) -> Result<Self, ScriptError> {
        let state = HostState::new(
            entity,
            behavior,
            module.seed_for(entity),
            config.memory_limit_bytes,
        );
        let mut store = Store::new(engine, state);
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(config.fuel_per_call)
            .map_err(|e| ScriptError::Runtime(format!("failed to set fuel: {e}")))?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| ScriptError::Runtime(format!("{e}")))?;

        let update = instance
            .get_typed_func::<(), ()>(&mut store, UPDATE_EXPORT)
            .map_err(|e| ScriptError::Runtime(format!("failed to resolve update(): {e}")))?;

        let mut this = Self {
            store,
            update,
            config: config.clone(),
        };

        if module.has_start() {
            let start = instance
                .get_typed_func::<(), ()>(&mut this.store, START_EXPORT)
                .map_err(|e| ScriptError::Runtime(format!("failed to resolve start(): {e}")))?;
            this.reset_fuel()?;
            start
                .call(&mut this.store, ())
                .map_err(|e| this.classify_trap(e))?;
        }

        tracing::debug!(
            %entity,
            %behavior,
            fuel_per_call = config.fuel_per_call,
            memory_limit = config.memory_limit_bytes,
            "behavior instance created"
        );

        Ok(this)
    }

    /// Run `update()` once for `input`.
    ///
    /// Resets fuel to [`ScriptConfig::fuel_per_call`] before calling so every
    /// frame gets the same budget. Returns the fuel consumed. Commands queued
    /// by the call stay in the instance until [`drain_commands`](Self::drain_commands).
    ///
    /// # Errors
    ///
    /// - [`ScriptError::OutOfFuel`] if the call exhausts its budget.
    /// - [`ScriptError::Trap`] if a WebAssembly trap occurs.
    pub fn call_update(&mut self, input: &FrameInput) -> Result<u64, ScriptError> {
        self.store.data_mut().begin_frame(input);
        self.reset_fuel()?;

        self.update
            .call(&mut self.store, ())
            .map_err(|e| self.classify_trap(e))?;

        let remaining = self
            .store
            .get_fuel()
            .map_err(|e| ScriptError::Runtime(format!("failed to read fuel: {e}")))?;
        let consumed = self.config.fuel_per_call.saturating_sub(remaining);

        tracing::trace!(
            entity = %self.store.data().entity,
            fuel_consumed = consumed,
            host_calls = self.store.data().host_call_count,
            "update() completed"
        );

        Ok(consumed)
    }

    /// Take the commands queued since the last drain.
    pub fn drain_commands(&mut self) -> Vec<TransformCommand> {
        self.store.data_mut().drain_commands()
    }

    /// Discard queued commands without applying them.
    pub(crate) fn discard_commands(&mut self) {
        self.store.data_mut().commands.clear();
    }

    /// Entity this instance drives.
    pub fn entity(&self) -> EntityId {
        self.store.data().entity
    }

    /// Behavior this instance was created from.
    pub fn behavior(&self) -> BehaviorHandle {
        self.store.data().behavior
    }

    /// Host state, for inspection.
    pub fn host_state(&self) -> &HostState {
        self.store.data()
    }

    /// Fuel left after the last call.
    pub fn fuel_remaining(&self) -> u64 {
        self.store.get_fuel().unwrap_or(0)
    }

    // -- Internal helpers ---------------------------------------------------

    fn reset_fuel(&mut self) -> Result<(), ScriptError> {
        self.store
            .set_fuel(self.config.fuel_per_call)
            .map_err(|e| ScriptError::Runtime(format!("failed to set fuel: {e}")))
    }

    fn classify_trap(&self, error: anyhow::Error) -> ScriptError {
        for cause in error.chain() {
            if let Some(trap) = cause.downcast_ref::<wasmtime::Trap>() {
                if *trap == wasmtime::Trap::OutOfFuel {
                    return ScriptError::OutOfFuel {
                        budget: self.config.fuel_per_call,
                    };
                }
                return ScriptError::Trap(format!("{error}"));
            }
        }
        ScriptError::Runtime(format!("{error}"))
    }
}

impl std::fmt::Debug for BehaviorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorInstance")
            .field("host", self.store.data())
            .field("config", &self.config)
            .field("fuel_remaining", &self.fuel_remaining())
            .finish_non_exhaustive()
    }
}
