//! Shared server state injected into every handler.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use scriba_core::hardware::HardwareProfile;
use scriba_core::{CheckpointStore, EventBus, JobStore, Scheduler};

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub store: Arc<JobStore>,
    pub bus: Arc<EventBus>,
    pub checkpoints: Arc<CheckpointStore>,
    pub hardware: &'static HardwareProfile,
    /// Directory scanned by the batch-intake endpoint.
    pub input_dir: PathBuf,
    /// Jobs with a proxy remux currently in flight.
    pub proxies_in_flight: Arc<Mutex<HashSet<String>>>,
}
