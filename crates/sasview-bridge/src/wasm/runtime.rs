//! WASM interpreter backend using wasmtime.
//!
//! Uses wasmtime-wasi preview1 for compatibility with standard WASM modules.

use super::config::{WasiCapabilities, WasmConfig};
use super::host_functions::{FsHostFunctions, MountTable};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::interpreter::{Interpreter, ObjectId};

use std::path::{Path, PathBuf};
use std::time::Instant;

use wasmtime::*;

/// Host state for the WASM store, containing WASI preview1 context.
pub struct WasmHostState {
    preview1: wasmtime_wasi::preview1::WasiP1Ctx,
    limits: StoreLimits,
    pub(crate) mounts: MountTable,
}

impl WasmHostState {
    /// Get the preview1 context.
    fn preview1(&mut self) -> &mut wasmtime_wasi::preview1::WasiP1Ctx {
        &mut self.preview1
    }
}

/// A wasmtime engine configured for the interpreter.
pub struct WasmEngine {
    engine: Engine,
    config: WasmConfig,
}

/// A compiled interpreter module.
pub struct WasmModule {
    module: Module,
    name: String,
}

/// Guest exports the bridge calls, resolved once at instantiation.
struct GuestAbi {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: TypedFunc<(i32, i32), ()>,
    init: TypedFunc<(), i32>,
    install: TypedFunc<(i32, i32, i32, i32), i32>,
    mkdir: TypedFunc<(i32, i32), i32>,
    eval: TypedFunc<(i32, i32), i32>,
    value_len: TypedFunc<i32, i32>,
    value_read: TypedFunc<(i32, i32), i32>,
    destroy: TypedFunc<i32, i32>,
    error_len: TypedFunc<(), i32>,
    error_read: TypedFunc<i32, i32>,
}

/// An instantiated interpreter module.
pub struct WasmInterpreter {
    store: Store<WasmHostState>,
    abi: GuestAbi,
    fuel_limit: Option<u64>,
    name: String,
}

impl WasmEngine {
    /// Create a new engine with the given configuration.
    pub fn new(config: WasmConfig) -> Result<Self> {
        let mut engine_config = Config::new();

        // Configure optimization
        engine_config.cranelift_opt_level(match config.optimization_level {
            0 => OptLevel::None,
            _ => OptLevel::Speed,
        });

        engine_config.wasm_simd(config.enable_simd);

        // Enable fuel metering if configured
        if config.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        // Configure caching if path provided
        if let Some(ref cache_path) = config.cache_path {
            if let Err(e) = engine_config.cache_config_load(cache_path) {
                tracing::warn!("Failed to load cache config: {}", e);
            }
        }

        let engine = Engine::new(&engine_config)
            .map_err(|e| BridgeError::RuntimeInit(format!("engine creation failed: {}", e)))?;

        Ok(Self { engine, config })
    }

    /// Load an interpreter module from a file.
    pub fn load_module(&self, path: impl AsRef<Path>) -> Result<WasmModule> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let module = Module::from_file(&self.engine, path)
            .map_err(|e| BridgeError::RuntimeInit(format!("module load failed: {}", e)))?;

        Ok(WasmModule { module, name })
    }

    /// Load an interpreter module from bytes (binary or text format).
    pub fn load_module_bytes(&self, name: &str, bytes: &[u8]) -> Result<WasmModule> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| BridgeError::RuntimeInit(format!("module creation failed: {}", e)))?;

        Ok(WasmModule {
            module,
            name: name.to_string(),
        })
    }

    /// Instantiate a module and boot the interpreter inside it.
    pub fn instantiate(&self, module: &WasmModule) -> Result<WasmInterpreter> {
        let host_state = self.build_host_state(&self.config.capabilities)?;
        let mut store = Store::new(&self.engine, host_state);

        // Configure resource limits via the stored limiter
        store.limiter(|state| &mut state.limits);

        if let Some(fuel) = self.config.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::RuntimeInit(format!("fuel setup failed: {}", e)))?;
        }

        // Create linker and add WASI preview1 functions
        let mut linker: Linker<WasmHostState> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |state| state.preview1())
            .map_err(|e| BridgeError::RuntimeInit(format!("WASI link failed: {}", e)))?;

        // Register filesystem host functions (sasview_fs namespace)
        FsHostFunctions::register(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| BridgeError::RuntimeInit(format!("instantiation failed: {}", e)))?;

        let abi = GuestAbi::resolve(&instance, &mut store)?;
        let mut interpreter = WasmInterpreter {
            store,
            abi,
            fuel_limit: self.config.fuel_limit,
            name: module.name.clone(),
        };

        let status = interpreter.call("sv_init", |abi, store| abi.init.call(store, ()))?;
        if status != 0 {
            let message = interpreter.last_error();
            return Err(BridgeError::RuntimeInit(format!(
                "interpreter boot failed ({}): {}",
                status, message
            )));
        }
        tracing::debug!(module = %interpreter.name, "interpreter booted");

        Ok(interpreter)
    }

    /// Build host state from capabilities.
    fn build_host_state(&self, caps: &WasiCapabilities) -> Result<WasmHostState> {
        let mut builder = wasmtime_wasi::WasiCtxBuilder::new();

        // Configure stdio
        if caps.stdin {
            builder.inherit_stdin();
        }
        if caps.stdout {
            builder.inherit_stdout();
        }
        if caps.stderr {
            builder.inherit_stderr();
        }

        // Add environment variables
        for (key, value) in &caps.env_vars {
            builder.env(key, value);
        }

        // Add arguments
        builder.args(&caps.args);

        // Add preopened directories (read-only)
        for dir in &caps.preopened_dirs_ro {
            builder
                .preopened_dir(
                    dir,
                    dir.to_string_lossy(),
                    wasmtime_wasi::DirPerms::READ,
                    wasmtime_wasi::FilePerms::READ,
                )
                .map_err(|e| {
                    BridgeError::RuntimeInit(format!("failed to open dir {:?}: {}", dir, e))
                })?;
        }

        // Build the preview2 context and wrap it for preview1 compatibility
        let preview1 = builder.build_p1();

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.max_memory)
            .build();

        Ok(WasmHostState {
            preview1,
            limits,
            mounts: MountTable::default(),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &WasmConfig {
        &self.config
    }
}

impl WasmModule {
    /// Get the module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get exported function names.
    pub fn exports(&self) -> impl Iterator<Item = &str> {
        self.module.exports().filter_map(|e| {
            if matches!(e.ty(), ExternType::Func(_)) {
                Some(e.name())
            } else {
                None
            }
        })
    }
}

impl GuestAbi {
    fn resolve(instance: &Instance, store: &mut Store<WasmHostState>) -> Result<Self> {
        fn func<P: WasmParams, R: WasmResults>(
            instance: &Instance,
            store: &mut Store<WasmHostState>,
            name: &str,
        ) -> Result<TypedFunc<P, R>> {
            instance.get_typed_func::<P, R>(&mut *store, name).map_err(|e| {
                BridgeError::RuntimeInit(format!("interpreter export '{}' missing: {}", name, e))
            })
        }

        let memory = instance
            .get_memory(&mut *store, "memory")
            .ok_or_else(|| BridgeError::RuntimeInit("no memory export found".to_string()))?;

        Ok(Self {
            memory,
            alloc: func(instance, store, "alloc")?,
            dealloc: func(instance, store, "dealloc")?,
            init: func(instance, store, "sv_init")?,
            install: func(instance, store, "sv_install")?,
            mkdir: func(instance, store, "sv_mkdir")?,
            eval: func(instance, store, "sv_eval")?,
            value_len: func(instance, store, "sv_value_len")?,
            value_read: func(instance, store, "sv_value_read")?,
            destroy: func(instance, store, "sv_destroy")?,
            error_len: func(instance, store, "sv_error_len")?,
            error_read: func(instance, store, "sv_error_read")?,
        })
    }
}

impl WasmInterpreter {
    /// Module name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get remaining fuel (if fuel metering enabled).
    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    /// Call a guest export, refilling fuel first and timing the call.
    fn call<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&GuestAbi, &mut Store<WasmHostState>) -> wasmtime::Result<R>,
    ) -> Result<R> {
        if let Some(fuel) = self.fuel_limit {
            self.store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Interpreter(format!("fuel setup failed: {}", e)))?;
        }
        let start = Instant::now();

        let value = f(&self.abi, &mut self.store)
            .map_err(|e| BridgeError::Interpreter(format!("{} trapped: {}", name, e)))?;

        tracing::trace!(
            call = name,
            elapsed_us = start.elapsed().as_micros() as u64,
            remaining_fuel = ?self.remaining_fuel(),
            "guest call"
        );
        Ok(value)
    }

    /// Copy `bytes` into a fresh guest allocation.
    fn write_guest(&mut self, bytes: &[u8]) -> Result<(i32, i32)> {
        let len = i32::try_from(bytes.len())
            .map_err(|_| BridgeError::Interpreter("argument too large".to_string()))?;
        let ptr = self.call("alloc", |abi, store| abi.alloc.call(store, len))?;
        self.abi
            .memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|e| BridgeError::Interpreter(format!("memory write failed: {}", e)))?;
        Ok((ptr, len))
    }

    fn free_guest(&mut self, (ptr, len): (i32, i32)) {
        if let Err(e) = self.call("dealloc", |abi, store| abi.dealloc.call(store, (ptr, len))) {
            tracing::warn!("guest dealloc failed: {}", e);
        }
    }

    /// Read `len` bytes produced by `fill(ptr)` out of a temporary guest allocation.
    fn read_guest(
        &mut self,
        len: i32,
        fill: impl FnOnce(&GuestAbi, &mut Store<WasmHostState>, i32) -> wasmtime::Result<i32>,
    ) -> Result<Vec<u8>> {
        let ptr = self.call("alloc", |abi, store| abi.alloc.call(store, len))?;
        let result = self
            .call("read", |abi, store| fill(abi, store, ptr))
            .and_then(|written| {
                if written != len {
                    return Err(BridgeError::Interpreter(format!(
                        "guest wrote {} bytes, expected {}",
                        written, len
                    )));
                }
                let mut buf = vec![0u8; len as usize];
                self.abi
                    .memory
                    .read(&self.store, ptr as usize, &mut buf)
                    .map_err(|e| BridgeError::Interpreter(format!("memory read failed: {}", e)))?;
                Ok(buf)
            });
        self.free_guest((ptr, len));
        result
    }

    /// The interpreter's message for the last failed call.
    fn last_error(&mut self) -> String {
        let message = self
            .call("sv_error_len", |abi, store| abi.error_len.call(store, ()))
            .and_then(|len| {
                self.read_guest(len.max(0), |abi, store, ptr| abi.error_read.call(store, ptr))
            });
        match message {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => format!("<error message unavailable: {}>", e),
        }
    }

    /// Call an export taking one guest string and returning a status code.
    fn call_with_str(
        &mut self,
        name: &str,
        arg: &str,
        f: impl FnOnce(&GuestAbi, &mut Store<WasmHostState>, (i32, i32)) -> wasmtime::Result<i32>,
    ) -> Result<i32> {
        let arg = self.write_guest(arg.as_bytes())?;
        let result = self.call(name, |abi, store| f(abi, store, arg));
        self.free_guest(arg);
        result
    }
}

impl Interpreter for WasmInterpreter {
    fn install_packages(&mut self, packages: &[String], repository: &str) -> Result<()> {
        let repo = self.write_guest(repository.as_bytes())?;
        let mut outcome = Ok(());
        for package in packages {
            let status = self.call_with_str("sv_install", package, |abi, store, (ptr, len)| {
                abi.install.call(store, (ptr, len, repo.0, repo.1))
            });
            match status {
                Ok(0) => tracing::info!(package = %package, "package installed"),
                Ok(code) => {
                    let message = self.last_error();
                    outcome = Err(BridgeError::RuntimeInit(format!(
                        "installing {} from {} failed ({}): {}",
                        package, repository, code, message
                    )));
                    break;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.free_guest(repo);
        outcome
    }

    fn mkdir(&mut self, path: &str) -> Result<()> {
        let status = self.call_with_str("sv_mkdir", path, |abi, store, arg| abi.mkdir.call(store, arg))?;
        if status != 0 {
            let message = self.last_error();
            return Err(BridgeError::Interpreter(format!("mkdir {} failed: {}", path, message)));
        }
        Ok(())
    }

    fn mount(&mut self, host_dir: &Path, mount_point: &str) -> Result<()> {
        self.store.data_mut().mounts.bind(mount_point, host_dir)
    }

    fn unmount(&mut self, mount_point: &str) -> Result<()> {
        self.store.data_mut().mounts.unbind(mount_point)
    }

    fn mounted(&self, mount_point: &str) -> Option<PathBuf> {
        self.store.data().mounts.get(mount_point).map(Path::to_path_buf)
    }

    fn eval(&mut self, expr: &str) -> Result<ObjectId> {
        let handle = self.call_with_str("sv_eval", expr, |abi, store, arg| abi.eval.call(store, arg))?;
        if handle < 0 {
            return Err(BridgeError::Evaluation(self.last_error()));
        }
        Ok(ObjectId(handle as u32))
    }

    fn transfer(&mut self, id: ObjectId) -> Result<Vec<u8>> {
        let handle = id.0 as i32;
        let len = self.call("sv_value_len", |abi, store| abi.value_len.call(store, handle))?;
        if len < 0 {
            return Err(BridgeError::Interpreter(format!("unknown object {}", id)));
        }
        self.read_guest(len, |abi, store, ptr| abi.value_read.call(store, (handle, ptr)))
    }

    fn destroy(&mut self, id: ObjectId) -> Result<()> {
        let status = self.call("sv_destroy", |abi, store| abi.destroy.call(store, id.0 as i32))?;
        if status != 0 {
            return Err(BridgeError::Interpreter(format!("unknown object {}", id)));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        tracing::debug!(module = %self.name, "interpreter shut down");
    }
}

/// Boot a [`WasmInterpreter`] from `config.wasm`.
pub fn boot_interpreter(config: &BridgeConfig) -> Result<Box<dyn Interpreter>> {
    let module_path = config.wasm.interpreter_module.as_ref().ok_or_else(|| {
        BridgeError::RuntimeInit("no interpreter module configured".to_string())
    })?;
    let engine = WasmEngine::new(config.wasm.clone())?;
    let module = engine.load_module(module_path)?;
    Ok(Box::new(engine.instantiate(&module)?))
}
