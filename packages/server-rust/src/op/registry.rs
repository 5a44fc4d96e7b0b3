use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use opflow_core::OpTypeId;
use parking_lot::Mutex;

use super::operation::{CreateAsTarget, Op, RegisteredOp};

// ---------------------------------------------------------------------------
// OpRegistration
// ---------------------------------------------------------------------------

/// Builds a fresh target-side instance.
pub type OpFactory = Arc<dyn Fn() -> Box<dyn Op> + Send + Sync>;

/// One protocol known to the registry.
#[derive(Clone)]
pub struct OpRegistration {
    id: OpTypeId,
    name: &'static str,
    factory: OpFactory,
}

impl OpRegistration {
    /// Pairs an id and a name with a factory for target instances.
    pub fn new(
        id: OpTypeId,
        name: &'static str,
        factory: impl Fn() -> Box<dyn Op> + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            name,
            factory: Arc::new(factory),
        }
    }

    /// Registration for a protocol type, built from its associated constants.
    #[must_use]
    pub fn of<T: RegisteredOp>() -> Self {
        Self::new(T::OP_ID, T::OP_NAME, || {
            Box::new(T::create_as_target(CreateAsTarget))
        })
    }

    /// Protocol id carried in every message of its conversations.
    #[must_use]
    pub fn id(&self) -> OpTypeId {
        self.id
    }

    /// Protocol name used in logs and introspection.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Instantiates a target-side op.
    #[must_use]
    pub fn create(&self) -> Box<dyn Op> {
        (self.factory)()
    }

    /// Builds one instance and checks that it reports the id and name it was
    /// registered under. Id and name are queried only here.
    fn verify(&self) -> Result<(), RegistryError> {
        let sample = self.create();
        if sample.op_type_id() != self.id || sample.op_type_name() != self.name {
            return Err(RegistryError::IdentityMismatch {
                id: self.id,
                name: self.name,
                reported_id: sample.op_type_id(),
                reported_name: sample.op_type_name(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for OpRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistration")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Registration failures. Configuration errors; an engine with any of these
/// refuses to start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("op id {id} for {name} is already bound to {existing}")]
    DuplicateId {
        id: OpTypeId,
        name: &'static str,
        existing: &'static str,
    },
    #[error("op name {name} is already registered")]
    DuplicateName { name: &'static str },
    #[error("no operation registered for id {id}")]
    NotFound { id: OpTypeId },
    #[error("registry is sealed; use register_live")]
    Sealed,
    #[error(
        "{name} ({id}) builds instances reporting {reported_name} ({reported_id})"
    )]
    IdentityMismatch {
        id: OpTypeId,
        name: &'static str,
        reported_id: OpTypeId,
        reported_name: &'static str,
    },
}

// ---------------------------------------------------------------------------
// OpRegistry
// ---------------------------------------------------------------------------

type OpTable = HashMap<OpTypeId, Arc<OpRegistration>>;

/// Maps op type ids to target-side factories.
///
/// Two registration paths:
/// - **Before start** (`register`): `&mut self`, so no locking. Entries are
///   staged and published by `seal()`.
/// - **After start** (`register_live`): serialized by a writer mutex; the new
///   table is published with a copy-on-write swap, so `lookup` never waits
///   on a writer.
pub struct OpRegistry {
    staged: OpTable,
    sealed: bool,
    live: ArcSwap<OpTable>,
    writer: Mutex<()>,
}

impl OpRegistry {
    /// Empty, unsealed registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            staged: HashMap::new(),
            sealed: false,
            live: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
        }
    }

    /// Pre-start registration.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId`/`DuplicateName` on a collision with any earlier
    /// registration, `IdentityMismatch` if the factory builds instances that
    /// report a different id or name, and `Sealed` once `seal()` was called.
    pub fn register(&mut self, registration: OpRegistration) -> Result<(), RegistryError> {
        if self.sealed {
            return Err(RegistryError::Sealed);
        }
        registration.verify()?;
        check_unique(&registration, &self.staged, &self.live.load())?;
        tracing::debug!(
            op_id = %registration.id,
            op_name = registration.name,
            "operation registered"
        );
        self.staged.insert(registration.id, Arc::new(registration));
        Ok(())
    }

    /// Pre-start registration of a protocol type.
    ///
    /// # Errors
    ///
    /// See [`OpRegistry::register`].
    pub fn register_op<T: RegisteredOp>(&mut self) -> Result<(), RegistryError> {
        self.register(OpRegistration::of::<T>())
    }

    /// Publishes staged registrations and closes the pre-start path.
    pub fn seal(&mut self) {
        if self.sealed {
            return;
        }
        let _guard = self.writer.lock();
        let mut table = OpTable::clone(&self.live.load());
        table.extend(self.staged.drain());
        self.live.store(Arc::new(table));
        self.sealed = true;
    }

    /// Whether `seal` ran. Only `register_live` is accepted afterwards.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Post-start registration, safe to call concurrently with lookups.
    ///
    /// # Errors
    ///
    /// Same as [`OpRegistry::register`], minus `Sealed`.
    pub fn register_live(&self, registration: OpRegistration) -> Result<(), RegistryError> {
        registration.verify()?;
        let _guard = self.writer.lock();
        let current = self.live.load_full();
        check_unique(&registration, &self.staged, &current)?;
        let mut table = OpTable::clone(&current);
        tracing::info!(
            op_id = %registration.id,
            op_name = registration.name,
            "operation registered after start"
        );
        table.insert(registration.id, Arc::new(registration));
        self.live.store(Arc::new(table));
        Ok(())
    }

    /// Finds the factory for `id`. Only published registrations are visible.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::NotFound` for unknown ids.
    pub fn lookup(&self, id: OpTypeId) -> Result<Arc<OpRegistration>, RegistryError> {
        self.live
            .load()
            .get(&id)
            .cloned()
            .ok_or(RegistryError::NotFound { id })
    }

    /// Published registrations as `(id, name)`, sorted by name.
    #[must_use]
    pub fn entries(&self) -> Vec<(OpTypeId, &'static str)> {
        let mut out: Vec<_> = self
            .live
            .load()
            .values()
            .map(|r| (r.id, r.name))
            .collect();
        out.sort_by_key(|(_, name)| *name);
        out
    }

    /// Number of registered protocols visible to `lookup`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.load().len() + self.staged.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OpRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OpRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpRegistry")
            .field("sealed", &self.sealed)
            .field("staged", &self.staged.len())
            .field("live", &self.live.load().len())
            .finish()
    }
}

fn check_unique(
    registration: &OpRegistration,
    staged: &OpTable,
    live: &OpTable,
) -> Result<(), RegistryError> {
    for table in [staged, live] {
        if let Some(existing) = table.get(&registration.id) {
            return Err(RegistryError::DuplicateId {
                id: registration.id,
                name: registration.name,
                existing: existing.name,
            });
        }
        if table.values().any(|r| r.name == registration.name) {
            return Err(RegistryError::DuplicateName {
                name: registration.name,
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
