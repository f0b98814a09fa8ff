//! Shared "what to watch" state.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use api_types::ContainerId;
use api_types::JobId;

use crate::binding::DeviceBinding;

/// How a registration batch is applied to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RegistrationMode {
    /// Discard every current entry and install the batch
    Replace,
    /// Upsert the batch, keeping entries of containers it does not mention
    Merge,
}

/// A watched container: its job and the GPUs it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEntry {
    job_id: JobId,
    bindings: Vec<DeviceBinding>,
}

impl WatchEntry {
    /// Returns `None` for containers without GPU, which are never watched.
    pub fn new(job_id: JobId, bindings: Vec<DeviceBinding>) -> Option<Self> {
        (!bindings.is_empty()).then_some(Self { job_id, bindings })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn bindings(&self) -> &[DeviceBinding] {
        &self.bindings
    }
}

pub type WatchSnapshot = BTreeMap<ContainerId, WatchEntry>;

/// Mapping from container to [`WatchEntry`], guarded by a single lock.
///
/// Every mutation and every snapshot takes the whole-map lock, so readers
/// never observe a partially applied batch.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    entries: Mutex<WatchSnapshot>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WatchSnapshot> {
        // Entries are plain data, a panic while holding the guard cannot
        // leave them half-updated.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `batch` under `mode`.
    ///
    /// In [`RegistrationMode::Replace`] the current entries of the `retained`
    /// containers survive the replacement unless the batch overrides them.
    pub fn apply(&self, batch: WatchSnapshot, mode: RegistrationMode, retained: &[ContainerId]) {
        let mut entries = self.lock();
        if mode == RegistrationMode::Replace {
            entries.retain(|container_id, _| retained.contains(container_id));
        }
        entries.extend(batch);
    }

    pub fn replace(&self, batch: WatchSnapshot) {
        self.apply(batch, RegistrationMode::Replace, &[]);
    }

    pub fn merge(&self, batch: WatchSnapshot) {
        self.apply(batch, RegistrationMode::Merge, &[]);
    }

    /// Remove the given containers, returning the ones that were watched.
    pub fn unregister(&self, container_ids: &[ContainerId]) -> Vec<ContainerId> {
        let mut entries = self.lock();
        container_ids
            .iter()
            .filter(|container_id| {
                let removed = entries.remove(*container_id).is_some();
                if !removed {
                    tracing::warn!(
                        "Tried to stop watching unknown container: {}",
                        container_id
                    );
                }
                removed
            })
            .cloned()
            .collect()
    }

    /// A consistent copy of all entries.
    pub fn snapshot(&self) -> WatchSnapshot {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use similar_asserts::assert_eq;

    use super::*;

    fn uuid_entry(job: &str, uuids: &[&str]) -> WatchEntry {
        WatchEntry::new(
            JobId::new(job),
            uuids
                .iter()
                .map(|uuid| DeviceBinding::Uuid(uuid.to_string()))
                .collect(),
        )
        .unwrap()
    }

    fn batch(entries: &[(&str, WatchEntry)]) -> WatchSnapshot {
        entries
            .iter()
            .map(|(id, entry)| (ContainerId::new(*id), entry.clone()))
            .collect()
    }

    #[test]
    fn entry_without_bindings_is_rejected() {
        assert!(WatchEntry::new(JobId::new("j1"), vec![]).is_none());
    }

    #[test]
    fn replace_installs_exactly_the_new_set() {
        let registry = WatchRegistry::new();
        registry.merge(batch(&[
            ("c1", uuid_entry("j1", &["GPU-a"])),
            ("c2", uuid_entry("j2", &["GPU-b"])),
        ]));

        let replacement = batch(&[("c3", uuid_entry("j3", &["GPU-c"]))]);
        registry.replace(replacement.clone());

        assert_eq!(registry.snapshot(), replacement);
    }

    #[test]
    fn replace_retains_requested_entries() {
        let registry = WatchRegistry::new();
        registry.merge(batch(&[
            ("c1", uuid_entry("j1", &["GPU-a"])),
            ("c2", uuid_entry("j2", &["GPU-b"])),
        ]));

        registry.apply(
            batch(&[("c3", uuid_entry("j3", &["GPU-c"]))]),
            RegistrationMode::Replace,
            &[ContainerId::new("c1"), ContainerId::new("unknown")],
        );

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.keys().cloned().collect::<Vec<_>>(),
            vec![ContainerId::new("c1"), ContainerId::new("c3")]
        );
        assert_eq!(snapshot[&ContainerId::new("c1")].job_id().as_str(), "j1");
    }

    #[test]
    fn merge_keeps_untouched_entries() {
        let registry = WatchRegistry::new();
        registry.merge(batch(&[
            ("c1", uuid_entry("j1", &["GPU-a"])),
            ("c2", uuid_entry("j2", &["GPU-b"])),
        ]));
        registry.merge(batch(&[
            ("c2", uuid_entry("j2-new", &["GPU-c"])),
            ("c3", uuid_entry("j3", &["GPU-d"])),
        ]));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[&ContainerId::new("c1")].job_id().as_str(), "j1");
        assert_eq!(snapshot[&ContainerId::new("c2")].job_id().as_str(), "j2-new");
        assert_eq!(snapshot[&ContainerId::new("c3")].job_id().as_str(), "j3");
    }

    #[test]
    fn unregister_reports_removed_ids_only() {
        let registry = WatchRegistry::new();
        registry.merge(batch(&[("c1", uuid_entry("j1", &["GPU-a"]))]));

        let removed = registry.unregister(&[ContainerId::new("c1"), ContainerId::new("missing")]);

        assert_eq!(removed, vec![ContainerId::new("c1")]);
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshots_never_observe_partial_batches() {
        const BATCHES: usize = 200;
        const BATCH_SIZE: usize = 8;

        let registry = Arc::new(WatchRegistry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for b in 0..BATCHES {
                    let entries = (0..BATCH_SIZE)
                        .map(|i| {
                            (
                                ContainerId::new(format!("c{b}-{i}")),
                                uuid_entry(&format!("j{b}"), &["GPU-a", "GPU-b"]),
                            )
                        })
                        .collect();
                    registry.merge(entries);
                }
            })
        };

        while !writer.is_finished() {
            let snapshot = registry.snapshot();
            let mut per_job: BTreeMap<&str, usize> = BTreeMap::new();
            for entry in snapshot.values() {
                assert_eq!(entry.bindings().len(), 2);
                *per_job.entry(entry.job_id().as_str()).or_default() += 1;
            }
            for count in per_job.values() {
                assert_eq!(*count, BATCH_SIZE);
            }
        }
        writer.join().unwrap();

        assert_eq!(registry.len(), BATCHES * BATCH_SIZE);
    }
}
