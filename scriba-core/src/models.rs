//! Model manager — lazy, serialized load/unload of heavy engines.
//!
//! At most one heavy model (separator, primary ASR, secondary ASR) may be
//! resident on the accelerator at a time unless the hardware probe reported
//! headroom for two. Acquisitions are serialized behind one process-wide
//! exclusion lock, so two acquisitions can never straddle a model swap.
//!
//! Handles follow the `Arc<Mutex<Option<Box<dyn …>>>>` shape: eviction
//! clears the cell, and a handle held across an eviction surfaces
//! `EngineUnavailable` instead of touching a stale model.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::chunk::SeparationTier;
use crate::engines::{
    EngineProvider, LlmEngine, PrimaryAsrEngine, SecondaryAsrEngine, SeparatorEngine, VadEngine,
};
use crate::error::{Result, ScribaError};

/// Named engine slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSlot {
    Vad,
    Separator,
    PrimaryAsr,
    SecondaryAsr,
    Llm,
}

impl ModelSlot {
    /// Heavy slots occupy accelerator memory and conflict pairwise.
    pub fn is_heavy(self) -> bool {
        matches!(
            self,
            ModelSlot::Separator | ModelSlot::PrimaryAsr | ModelSlot::SecondaryAsr
        )
    }

    fn name(self) -> &'static str {
        match self {
            ModelSlot::Vad => "vad",
            ModelSlot::Separator => "separator",
            ModelSlot::PrimaryAsr => "primary_asr",
            ModelSlot::SecondaryAsr => "secondary_asr",
            ModelSlot::Llm => "llm",
        }
    }
}

/// Shared handle to a loaded engine. Cloning is cheap; the engine itself is
/// behind a mutex because engines are stateful (`&mut self` contracts).
pub struct EngineHandle<T: ?Sized> {
    cell: Arc<Mutex<Option<Box<T>>>>,
    slot: ModelSlot,
}

impl<T: ?Sized> Clone for EngineHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            slot: self.slot,
        }
    }
}

impl<T: ?Sized> EngineHandle<T> {
    /// Run `f` against the engine. Fails with `EngineUnavailable` if the
    /// slot was evicted after this handle was acquired.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let mut guard = self.cell.lock();
        match guard.as_mut() {
            Some(engine) => f(&mut **engine),
            None => Err(ScribaError::EngineUnavailable {
                engine: self.slot.name(),
                message: "slot evicted while handle was held".into(),
            }),
        }
    }
}

type Cell<T> = Arc<Mutex<Option<Box<T>>>>;

struct Slots {
    vad: Cell<dyn VadEngine>,
    separator: Cell<dyn SeparatorEngine>,
    primary_asr: Cell<dyn PrimaryAsrEngine>,
    secondary_asr: Cell<dyn SecondaryAsrEngine>,
    llm: Cell<dyn LlmEngine>,
}

pub struct ModelManager {
    provider: Arc<dyn EngineProvider>,
    /// Accelerator headroom for two resident heavy models ("both fit").
    relaxed_residency: bool,
    /// Process-wide exclusion lock serializing every acquire/evict.
    gate: Mutex<()>,
    slots: Slots,
}

impl ModelManager {
    pub fn new(provider: Arc<dyn EngineProvider>, relaxed_residency: bool) -> Self {
        Self {
            provider,
            relaxed_residency,
            gate: Mutex::new(()),
            slots: Slots {
                vad: Arc::new(Mutex::new(None)),
                separator: Arc::new(Mutex::new(None)),
                primary_asr: Arc::new(Mutex::new(None)),
                secondary_asr: Arc::new(Mutex::new(None)),
                llm: Arc::new(Mutex::new(None)),
            },
        }
    }

    /// Slots currently holding a loaded engine.
    pub fn resident_slots(&self) -> Vec<ModelSlot> {
        let mut out = Vec::new();
        if self.slots.vad.lock().is_some() {
            out.push(ModelSlot::Vad);
        }
        if self.slots.separator.lock().is_some() {
            out.push(ModelSlot::Separator);
        }
        if self.slots.primary_asr.lock().is_some() {
            out.push(ModelSlot::PrimaryAsr);
        }
        if self.slots.secondary_asr.lock().is_some() {
            out.push(ModelSlot::SecondaryAsr);
        }
        if self.slots.llm.lock().is_some() {
            out.push(ModelSlot::Llm);
        }
        out
    }

    pub fn acquire_vad(&self) -> Result<EngineHandle<dyn VadEngine>> {
        let _gate = self.gate.lock();
        self.load_into(ModelSlot::Vad, &self.slots.vad, || self.provider.load_vad())?;
        Ok(EngineHandle {
            cell: Arc::clone(&self.slots.vad),
            slot: ModelSlot::Vad,
        })
    }

    /// Acquire the separator at a specific tier. A resident separator at a
    /// different tier is evicted and reloaded.
    pub fn acquire_separator(
        &self,
        tier: SeparationTier,
    ) -> Result<EngineHandle<dyn SeparatorEngine>> {
        let _gate = self.gate.lock();
        self.evict_conflicting(ModelSlot::Separator);
        {
            let mut cell = self.slots.separator.lock();
            if cell.as_ref().map(|s| s.tier()) != Some(tier) {
                if cell.take().is_some() {
                    debug!(?tier, "separator tier changed — reloading");
                }
            }
        }
        self.load_into(ModelSlot::Separator, &self.slots.separator, || {
            self.provider.load_separator(tier)
        })?;
        Ok(EngineHandle {
            cell: Arc::clone(&self.slots.separator),
            slot: ModelSlot::Separator,
        })
    }

    pub fn acquire_primary_asr(&self) -> Result<EngineHandle<dyn PrimaryAsrEngine>> {
        let _gate = self.gate.lock();
        self.evict_conflicting(ModelSlot::PrimaryAsr);
        self.load_into(ModelSlot::PrimaryAsr, &self.slots.primary_asr, || {
            self.provider.load_primary_asr()
        })?;
        Ok(EngineHandle {
            cell: Arc::clone(&self.slots.primary_asr),
            slot: ModelSlot::PrimaryAsr,
        })
    }

    pub fn acquire_secondary_asr(&self) -> Result<EngineHandle<dyn SecondaryAsrEngine>> {
        let _gate = self.gate.lock();
        self.evict_conflicting(ModelSlot::SecondaryAsr);
        self.load_into(ModelSlot::SecondaryAsr, &self.slots.secondary_asr, || {
            self.provider.load_secondary_asr()
        })?;
        Ok(EngineHandle {
            cell: Arc::clone(&self.slots.secondary_asr),
            slot: ModelSlot::SecondaryAsr,
        })
    }

    pub fn acquire_llm(&self) -> Result<EngineHandle<dyn LlmEngine>> {
        let _gate = self.gate.lock();
        self.load_into(ModelSlot::Llm, &self.slots.llm, || self.provider.load_llm())?;
        Ok(EngineHandle {
            cell: Arc::clone(&self.slots.llm),
            slot: ModelSlot::Llm,
        })
    }

    /// Release a slot: the handle is dropped by the caller but the model
    /// stays resident for cheap re-acquisition.
    pub fn release(&self, slot: ModelSlot) {
        debug!(slot = slot.name(), "released (model stays resident)");
    }

    /// Destroy the in-memory model for `slot`, freeing accelerator memory.
    pub fn evict(&self, slot: ModelSlot) {
        let _gate = self.gate.lock();
        self.evict_locked(slot);
    }

    fn evict_locked(&self, slot: ModelSlot) {
        let evicted = match slot {
            ModelSlot::Vad => self.slots.vad.lock().take().is_some(),
            ModelSlot::Separator => self.slots.separator.lock().take().is_some(),
            ModelSlot::PrimaryAsr => self.slots.primary_asr.lock().take().is_some(),
            ModelSlot::SecondaryAsr => self.slots.secondary_asr.lock().take().is_some(),
            ModelSlot::Llm => self.slots.llm.lock().take().is_some(),
        };
        if evicted {
            info!(slot = slot.name(), "evicted model");
        }
    }

    /// Evict every heavy slot that conflicts with an incoming heavy load.
    fn evict_conflicting(&self, incoming: ModelSlot) {
        if !incoming.is_heavy() || self.relaxed_residency {
            return;
        }
        for slot in [
            ModelSlot::Separator,
            ModelSlot::PrimaryAsr,
            ModelSlot::SecondaryAsr,
        ] {
            if slot != incoming {
                self.evict_locked(slot);
            }
        }
    }

    /// Load an engine into an empty cell, retrying once on a transient
    /// failure. Resident engines are reused as-is.
    fn load_into<T: ?Sized>(
        &self,
        slot: ModelSlot,
        cell: &Cell<T>,
        load: impl Fn() -> Result<Box<T>>,
    ) -> Result<()> {
        let mut guard = cell.lock();
        if guard.is_some() {
            return Ok(());
        }
        info!(slot = slot.name(), "loading model");
        let engine = match load() {
            Ok(e) => e,
            Err(e) if e.is_transient() => {
                warn!(slot = slot.name(), error = %e, "model load failed — retrying once");
                load()?
            }
            Err(e) => return Err(e),
        };
        *guard = Some(engine);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::stub::StubEngineProvider;

    fn manager() -> ModelManager {
        ModelManager::new(Arc::new(StubEngineProvider), false)
    }

    #[test]
    fn single_heavy_residency() {
        let m = manager();
        m.acquire_separator(SeparationTier::Light).unwrap();
        assert_eq!(m.resident_slots(), vec![ModelSlot::Separator]);

        m.acquire_primary_asr().unwrap();
        // Separator was evicted by the conflicting acquisition.
        assert_eq!(m.resident_slots(), vec![ModelSlot::PrimaryAsr]);
    }

    #[test]
    fn relaxed_residency_keeps_both() {
        let m = ModelManager::new(Arc::new(StubEngineProvider), true);
        m.acquire_separator(SeparationTier::Heavy).unwrap();
        m.acquire_primary_asr().unwrap();
        let resident = m.resident_slots();
        assert!(resident.contains(&ModelSlot::Separator));
        assert!(resident.contains(&ModelSlot::PrimaryAsr));
    }

    #[test]
    fn vad_does_not_conflict() {
        let m = manager();
        m.acquire_primary_asr().unwrap();
        m.acquire_vad().unwrap();
        let resident = m.resident_slots();
        assert!(resident.contains(&ModelSlot::Vad));
        assert!(resident.contains(&ModelSlot::PrimaryAsr));
    }

    #[test]
    fn handle_after_evict_is_unavailable() {
        let m = manager();
        let handle = m.acquire_primary_asr().unwrap();
        m.evict(ModelSlot::PrimaryAsr);
        let audio = crate::audio::AudioBuffer::new(vec![0.1; 1_000], 16_000);
        let err = handle.with(|asr| asr.transcribe(&audio, None)).unwrap_err();
        assert!(matches!(err, ScribaError::EngineUnavailable { .. }));
    }

    #[test]
    fn tier_change_reloads_separator() {
        let m = manager();
        let light = m.acquire_separator(SeparationTier::Light).unwrap();
        light
            .with(|s| {
                assert_eq!(s.tier(), SeparationTier::Light);
                Ok(())
            })
            .unwrap();
        let heavy = m.acquire_separator(SeparationTier::Heavy).unwrap();
        heavy
            .with(|s| {
                assert_eq!(s.tier(), SeparationTier::Heavy);
                Ok(())
            })
            .unwrap();
    }
}
