use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::internal::common::Map;
use crate::internal::common::resources::ResourceDescription;
use crate::{CoreId, ImplementationId};

/// One concrete way to execute a core element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub id: ImplementationId,
    pub core: CoreId,
    pub kind: ImplementationKind,
    pub signature: String,
    pub requirements: ResourceDescription,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ImplementationKind {
    Method,
    Mpi,
    OmpSs,
    OpenCl,
    Binary,
    Service,
}

/// An implementation waiting for the registry to assign its id.
#[derive(Debug, Clone)]
pub struct ImplementationDef {
    pub kind: ImplementationKind,
    pub signature: String,
    pub requirements: ResourceDescription,
}

impl ImplementationDef {
    pub fn method(signature: &str, requirements: ResourceDescription) -> Self {
        ImplementationDef {
            kind: ImplementationKind::Method,
            signature: signature.to_string(),
            requirements,
        }
    }
}

#[derive(Debug)]
struct CoreElement {
    signature: String,
    implementations: Vec<Implementation>,
}

/// Mapping from task signatures to dense core ids and their implementation
/// lists. Append-only; the version counter advances on every implementation
/// update so that workers can rebuild their capability tables lazily.
///
/// Owned by the process that drives the scheduler and passed in explicitly;
/// there is no global instance.
#[derive(Debug, Default)]
pub struct CoreRegistry {
    cores: Vec<CoreElement>,
    signatures: Map<String, CoreId>,
    version: u64,
}

impl CoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing id when the signature is already registered,
    /// otherwise allocates the next dense id.
    pub fn register_core(&mut self, signature: &str) -> CoreId {
        match self.signatures.get(signature) {
            Some(&id) => id,
            None => {
                let id = CoreId::new(self.cores.len() as u32);
                log::debug!("New core element registered '{signature}' as {id}");
                self.signatures.insert(signature.to_string(), id);
                self.cores.push(CoreElement {
                    signature: signature.to_string(),
                    implementations: Vec::new(),
                });
                id
            }
        }
    }

    /// Appends implementations to a core element. Implementations are never
    /// removed; ids are dense per core.
    pub fn register_implementations(
        &mut self,
        core: CoreId,
        defs: impl IntoIterator<Item = ImplementationDef>,
    ) -> SmallVec<[ImplementationId; 2]> {
        let element = self.core_mut(core);
        let mut added = SmallVec::new();
        for def in defs {
            let id = ImplementationId::new(element.implementations.len() as u32);
            element.implementations.push(Implementation {
                id,
                core,
                kind: def.kind,
                signature: def.signature,
                requirements: def.requirements,
            });
            added.push(id);
        }
        if !added.is_empty() {
            self.version += 1;
            log::debug!(
                "{} implementation(s) registered for core {core}, registry version {}",
                added.len(),
                self.version
            );
        }
        added
    }

    pub fn implementations(&self, core: CoreId) -> &[Implementation] {
        &self.core(core).implementations
    }

    pub fn implementation(&self, core: CoreId, implementation: ImplementationId) -> &Implementation {
        self.core(core)
            .implementations
            .get(implementation.as_num() as usize)
            .unwrap_or_else(|| panic!("Asking for invalid implementation {implementation} of core {core}"))
    }

    pub fn signature(&self, core: CoreId) -> &str {
        &self.core(core).signature
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    pub fn core_ids(&self) -> impl Iterator<Item = CoreId> + '_ {
        (0..self.cores.len() as u32).map(CoreId::new)
    }

    /// Bumped on every implementation update.
    pub fn version(&self) -> u64 {
        self.version
    }

    fn core(&self, core: CoreId) -> &CoreElement {
        self.cores
            .get(core.as_num() as usize)
            .unwrap_or_else(|| panic!("Asking for invalid core id={core}"))
    }

    fn core_mut(&mut self, core: CoreId) -> &mut CoreElement {
        self.cores
            .get_mut(core.as_num() as usize)
            .unwrap_or_else(|| panic!("Asking for invalid core id={core}"))
    }
}
