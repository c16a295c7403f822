//! C1: named key registry with probe/add/remove/ref-count and module
//! dispatch, grounded on `examples/original_source/lib/keyring/keyring.c`.
//!
//! The original keeps a single global keyring guarded by a recursive
//! mutex; `spdk_keyring_for_each_key` asserts its keyring argument is
//! null (§9 Open Question). We keep the single-global model (see
//! DESIGN.md) and expose the `for_each` scope as documentation rather
//! than plumbing for a second keyring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use snafu::Snafu;

use crate::error::{ErrorKind, ToErrorKind};

#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum Error {
    #[snafu(display("key '{name}' already exists"))]
    AlreadyExists { name: String },
    #[snafu(display("key '{name}' not found"))]
    NotFound { name: String },
    #[snafu(display("no memory available to allocate key '{name}'"))]
    NoMemory { name: String },
    #[snafu(display("permission denied: {reason}"))]
    PermissionDenied { reason: String },
    #[snafu(display("module '{module}' failed to probe key '{name}': {reason}"))]
    ProbeFailed {
        module: String,
        name: String,
        reason: String,
    },
}

impl ToErrorKind for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::NoMemory { .. } => ErrorKind::NoMemory,
            Error::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Error::ProbeFailed { .. } => ErrorKind::InternalDeviceError,
        }
    }
}

/// Trait implemented by keyring backends (file, linux keyutils, ...). Only
/// the interface is in scope here; concrete backends are external
/// collaborators per §1.
pub trait KeyringModule: Send + Sync {
    fn name(&self) -> &str;
    /// Attempt to materialize `name` into the keyring. Returning `Ok(())`
    /// means the module itself called [`Keyring::put`] (or equivalent) to
    /// insert the key; returning `Err` with anything other than "no such
    /// key" is fatal to the lookup (§4.1).
    fn probe_key(&self, keyring: &Keyring, name: &str) -> Result<(), ProbeOutcome>;
}

/// Distinguishes "this module doesn't have such a key" (non-fatal, try the
/// next module) from a genuine failure (fatal, surfaced to the caller).
#[derive(Debug)]
pub enum ProbeOutcome {
    NoSuchKey,
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct KeyRef {
    pub name: String,
}

struct Key {
    name: String,
    owning_module: String,
    removed: bool,
    probed: bool,
    refcount: u32,
}

#[derive(Default)]
struct Inner {
    keys: HashMap<String, Key>,
    removed_keys: HashMap<String, Key>,
    modules: Vec<Arc<dyn KeyringModule>>,
}

/// The global keyring. All mutations hold a single mutex, matching the
/// original's recursive-mutex single global (§4.1, §5).
pub struct Keyring {
    inner: Mutex<Inner>,
}

impl Default for Keyring {
    fn default() -> Self {
        Keyring {
            inner: Mutex::new(Inner::default()),
        }
    }
}

/// `<keyring>:<key>`; empty keyring prefix means global (§3).
fn local_name(name: &str) -> &str {
    match name.split_once(':') {
        Some((_, local)) => local,
        None => name,
    }
}

impl Keyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn init(&self) {
        tracing::info!("keyring initialized");
    }

    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().expect("keyring lock poisoned");
        inner.keys.clear();
        inner.removed_keys.clear();
        tracing::info!("keyring cleaned up");
    }

    pub fn register_module(&self, module: Arc<dyn KeyringModule>) {
        self.inner
            .lock()
            .expect("keyring lock poisoned")
            .modules
            .push(module);
    }

    /// Add a new key, explicitly (not via probing). Fails if a key with
    /// the same local name already exists.
    pub fn add(&self, name: &str, owning_module: &str) -> Result<KeyRef, Error> {
        let mut inner = self.inner.lock().expect("keyring lock poisoned");
        let local = local_name(name).to_string();
        if inner.keys.values().any(|k| local_name(&k.name) == local) {
            return Err(Error::AlreadyExists { name: name.to_string() });
        }
        inner.keys.insert(
            name.to_string(),
            Key {
                name: name.to_string(),
                owning_module: owning_module.to_string(),
                removed: false,
                probed: false,
                refcount: 1,
            },
        );
        Ok(KeyRef { name: name.to_string() })
    }

    /// Insert a key obtained via [`KeyringModule::probe_key`].
    fn insert_probed(&self, name: &str, owning_module: &str) {
        let mut inner = self.inner.lock().expect("keyring lock poisoned");
        inner.keys.insert(
            name.to_string(),
            Key {
                name: name.to_string(),
                owning_module: owning_module.to_string(),
                removed: false,
                probed: true,
                refcount: 1,
            },
        );
    }

    /// `get(name)`: search registered keys, else probe every module in
    /// turn. The first module whose `probe_key` succeeds must have
    /// inserted the key (§4.1).
    pub fn get(&self, name: &str) -> Result<KeyRef, Error> {
        {
            let mut inner = self.inner.lock().expect("keyring lock poisoned");
            if let Some(k) = inner.keys.get_mut(&local_existing(&inner, name)) {
                if !k.removed {
                    k.refcount += 1;
                    return Ok(KeyRef { name: k.name.clone() });
                }
            }
        }

        // Clone the module handles out from under the lock: `probe_key`
        // calls back into `put_probed`, which re-locks `inner`, so the
        // lock must not be held across the call (§4.1, §5 — the original's
        // recursive mutex is what this clone-then-release stands in for).
        let modules: Vec<Arc<dyn KeyringModule>> = {
            let inner = self.inner.lock().expect("keyring lock poisoned");
            inner.modules.clone()
        };

        for module in modules {
            let module_name = module.name().to_string();
            let outcome = module.probe_key(self, name);
            match outcome {
                Ok(()) => {
                    let mut inner = self.inner.lock().expect("keyring lock poisoned");
                    if let Some(k) = inner.keys.get(name) {
                        return Ok(KeyRef { name: k.name.clone() });
                    }
                    // Module claimed success but never inserted: treat as
                    // not-found rather than panic, matching "fatal errors
                    // other than no-such-key are surfaced" (§4.1).
                    return Err(Error::NotFound { name: name.to_string() });
                }
                Err(ProbeOutcome::NoSuchKey) => continue,
                Err(ProbeOutcome::Fatal(reason)) => {
                    return Err(Error::ProbeFailed {
                        module: module_name,
                        name: name.to_string(),
                        reason,
                    })
                }
            }
        }

        Err(Error::NotFound { name: name.to_string() })
    }

    /// Hook used by a [`KeyringModule`] while inside its `probe_key` call
    /// to register the materialized key before returning success.
    pub fn put_probed(&self, name: &str, owning_module: &str) {
        self.insert_probed(name, owning_module);
    }

    /// Drop a reference. A probed key at refcount 1 is single-shot: `put`
    /// removes it immediately (§4.1). A key already on `removed_keys`
    /// (removal in progress, kept alive by outstanding references) is
    /// dropped from there once its refcount reaches zero.
    pub fn put(&self, key_ref: KeyRef) {
        let mut inner = self.inner.lock().expect("keyring lock poisoned");
        if let Some(k) = inner.keys.get_mut(&key_ref.name) {
            k.refcount = k.refcount.saturating_sub(1);
            if k.probed && k.refcount == 0 {
                remove_locked(&mut inner, &key_ref.name, None);
            }
            return;
        }
        if let Some(k) = inner.removed_keys.get_mut(&key_ref.name) {
            k.refcount = k.refcount.saturating_sub(1);
            if k.refcount == 0 {
                inner.removed_keys.remove(&key_ref.name);
            }
        }
    }

    /// Mark `name` removed; it stays alive (on `removed_keys`) until its
    /// refcount drops to zero.
    pub fn remove(&self, name: &str, module: &str) -> Result<(), Error> {
        let mut inner = self.inner.lock().expect("keyring lock poisoned");
        remove_locked(&mut inner, name, Some(module))
    }

    /// Remove every key owned by `module` (module unregister path,
    /// supplemented from `keyring_rpc.c`'s per-module teardown).
    pub fn remove_module(&self, module: &str) {
        let mut inner = self.inner.lock().expect("keyring lock poisoned");
        let names: Vec<String> = inner
            .keys
            .values()
            .filter(|k| k.owning_module == module)
            .map(|k| k.name.clone())
            .collect();
        for name in names {
            let _ = remove_locked(&mut inner, &name, Some(module));
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&str)) {
        let inner = self.inner.lock().expect("keyring lock poisoned");
        for key in inner.keys.values() {
            f(&key.name);
        }
    }
}

fn local_existing(inner: &Inner, name: &str) -> String {
    let local = local_name(name);
    inner
        .keys
        .keys()
        .find(|k| local_name(k) == local)
        .cloned()
        .unwrap_or_else(|| name.to_string())
}

fn remove_locked(inner: &mut Inner, name: &str, module: Option<&str>) -> Result<(), Error> {
    let key = inner.keys.get(name).ok_or_else(|| Error::NotFound {
        name: name.to_string(),
    })?;
    if let Some(module) = module {
        if key.owning_module != module && !module.is_empty() {
            return Err(Error::PermissionDenied {
                reason: format!("key '{name}' is owned by module '{}'", key.owning_module),
            });
        }
    }
    let mut key = inner.keys.remove(name).unwrap();
    key.removed = true;
    if key.refcount == 0 {
        // Already unreferenced: drop immediately.
    } else {
        inner.removed_keys.insert(name.to_string(), key);
    }
    Ok(())
}
