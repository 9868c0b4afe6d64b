//! Per-item blur job state machine and worker loop

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::scheduler::Scheduler;
use crate::blur::BlurEngine;
use crate::cache::{CacheKey, DerivativeCache, DerivativePurpose};
use crate::core::error::{Result, ShieldError, StoreError};
use crate::core::types::{AttachmentId, BlurJobState, BlurPhase, DerivativeMapping, ItemId, ProtectedItem};
use crate::imaging;
use crate::store::{AttachmentStore, MetadataStore};

/// Check if a phase change is a valid job transition
pub fn can_transition(from: BlurPhase, to: BlurPhase) -> bool {
    match (from, to) {
        (BlurPhase::None, BlurPhase::Queued) => true,
        (BlurPhase::Queued, BlurPhase::Processing) => true,
        (BlurPhase::Queued, BlurPhase::None) => true,
        (BlurPhase::Processing, BlurPhase::Complete) => true,
        (BlurPhase::Processing, BlurPhase::Stopping) => true,
        (BlurPhase::Stopping, BlurPhase::None) => true,
        // Requeue after purge
        (BlurPhase::Complete, BlurPhase::Queued) => true,
        // Crash recovery
        (BlurPhase::Processing, BlurPhase::Queued) => true,
        // Cleanup resets any phase
        (_, BlurPhase::None) => true,
        _ => false,
    }
}

/// Result of an enqueue request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// No-op: a job is already queued, processing or stopping
    AlreadyActive(BlurPhase),
    /// No-op: use `requeue` to rebuild derivatives
    AlreadyComplete,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker will stop at its next checkpoint
    Stopping,
    /// The job had not started and was dropped
    Cancelled,
    NotRunning,
}

/// Effect of a sensitivity flag change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagChange {
    Enqueued(EnqueueOutcome),
    Purged(usize),
    Unchanged,
}

/// Summary of one worker run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunReport {
    pub phase: BlurPhase,
    /// Images blurred during this run
    pub blurred: u32,
    /// Images already mapped by an earlier run
    pub reused: u32,
    pub failed: u32,
}

/// Orchestrates blur derivative generation for sensitive items
#[derive(Clone)]
pub struct BlurJobManager {
    metadata: Arc<dyn MetadataStore>,
    attachments: Arc<dyn AttachmentStore>,
    engine: BlurEngine,
    cache: Arc<DerivativeCache>,
    scheduler: Arc<dyn Scheduler>,
    start_delay: Duration,
}

impl BlurJobManager {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        attachments: Arc<dyn AttachmentStore>,
        engine: BlurEngine,
        cache: Arc<DerivativeCache>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            metadata,
            attachments,
            engine,
            cache,
            scheduler,
            start_delay: Duration::from_secs(5),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    fn set_phase(&self, item: ItemId, state: &mut BlurJobState, phase: BlurPhase) -> Result<()> {
        if !can_transition(state.phase, phase) {
            return Err(ShieldError::Internal(format!(
                "invalid blur job transition {} -> {} for item {}",
                state.phase, phase, item
            )));
        }
        state.phase = phase;
        self.metadata.set_job_state(item, state)?;
        Ok(())
    }

    fn schedule(&self, item: ItemId) {
        let manager = self.clone();
        self.scheduler.schedule_once(
            self.start_delay,
            item,
            Box::new(move |item| {
                if let Err(e) = manager.run(item) {
                    warn!("Blur job for item {} failed: {}", item, e);
                }
            }),
        );
    }

    /// Queue a blur job; idempotent while one is active
    pub fn enqueue(&self, item: ItemId) -> Result<EnqueueOutcome> {
        if self.metadata.item(item)?.is_none() {
            return Err(StoreError::ItemNotFound { item }.into());
        }

        let state = self.metadata.job_state(item)?;
        match state.phase {
            phase if phase.is_active() => {
                debug!("Blur job for item {} already {}", item, phase);
                return Ok(EnqueueOutcome::AlreadyActive(phase));
            }
            BlurPhase::Complete => return Ok(EnqueueOutcome::AlreadyComplete),
            _ => {}
        }

        self.metadata.set_job_state(item, &BlurJobState::queued(Utc::now()))?;
        self.schedule(item);
        info!("Blur job queued for item {}", item);
        Ok(EnqueueOutcome::Queued)
    }

    /// Ask a job to stop at its next per-image checkpoint
    pub fn stop(&self, item: ItemId) -> Result<StopOutcome> {
        let mut state = self.metadata.job_state(item)?;
        match state.phase {
            BlurPhase::Processing => {
                self.set_phase(item, &mut state, BlurPhase::Stopping)?;
                info!("Stop requested for blur job of item {}", item);
                Ok(StopOutcome::Stopping)
            }
            BlurPhase::Queued => {
                self.set_phase(item, &mut state, BlurPhase::None)?;
                info!("Queued blur job for item {} cancelled", item);
                Ok(StopOutcome::Cancelled)
            }
            BlurPhase::Stopping => Ok(StopOutcome::Stopping),
            _ => Ok(StopOutcome::NotRunning),
        }
    }

    pub fn progress(&self, item: ItemId) -> Result<BlurJobState> {
        Ok(self.metadata.job_state(item)?)
    }

    /// Delete an item's blurred derivatives and reset its job
    ///
    /// Returns the number of cached files removed. A worker still running
    /// for the item observes the reset at its next checkpoint.
    pub fn purge(&self, item: ItemId) -> Result<usize> {
        let mapping = self.metadata.derivative_mapping(item)?;
        let mut removed = 0;
        for entry in mapping.entries() {
            if let Err(e) = self.attachments.delete(entry.blurred) {
                warn!("Failed to delete derivative attachment {}: {}", entry.blurred, e);
            }
            removed += self.cache.purge_purpose(entry.original, DerivativePurpose::Blur)?;
        }

        self.metadata.set_derivative_mapping(item, &DerivativeMapping::new())?;
        self.metadata.set_job_state(item, &BlurJobState::default())?;
        info!("Purged {} blurred derivatives of item {}", removed, item);
        Ok(removed)
    }

    /// Purge and queue a fresh job
    pub fn requeue(&self, item: ItemId) -> Result<EnqueueOutcome> {
        let state = self.metadata.job_state(item)?;
        if state.phase.is_active() {
            return Err(ShieldError::JobAlreadyRunning { item });
        }
        self.purge(item)?;
        self.enqueue(item)
    }

    /// React to the item's sensitivity flag being toggled
    pub fn handle_flag_change(&self, item: ItemId, was_sensitive: bool, is_sensitive: bool) -> Result<FlagChange> {
        match (was_sensitive, is_sensitive) {
            (false, true) => Ok(FlagChange::Enqueued(self.enqueue(item)?)),
            (true, false) => {
                self.stop(item)?;
                Ok(FlagChange::Purged(self.purge(item)?))
            }
            _ => Ok(FlagChange::Unchanged),
        }
    }

    /// Reschedule jobs a crashed worker left behind
    ///
    /// Processing jobs return to Queued with their progress intact, jobs
    /// waiting on a stop are reset, and queued jobs are scheduled again.
    pub fn recover_interrupted<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = ItemId>,
    {
        let mut rescheduled = 0;
        for item in items {
            let mut state = self.metadata.job_state(item)?;
            match state.phase {
                BlurPhase::Processing => {
                    self.set_phase(item, &mut state, BlurPhase::Queued)?;
                }
                BlurPhase::Stopping => {
                    self.set_phase(item, &mut state, BlurPhase::None)?;
                    continue;
                }
                BlurPhase::Queued => {}
                _ => continue,
            }
            self.schedule(item);
            rescheduled += 1;
        }
        if rescheduled > 0 {
            info!("Rescheduled {} interrupted blur jobs", rescheduled);
        }
        Ok(rescheduled)
    }

    /// Images a job for `owner` covers, in processing order
    pub fn enumerate_images(&self, owner: &ProtectedItem) -> Result<Vec<AttachmentId>> {
        let mut ordered: Vec<AttachmentId> = Vec::new();
        ordered.extend(owner.primary_image);
        ordered.extend(owner.inline_attachments());
        ordered.extend(self.attachments.attached_to(owner.id)?);
        ordered.extend(owner.protected_ids.iter().copied());

        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for id in ordered {
            if !id.is_valid() || !seen.insert(id) {
                continue;
            }
            match self.attachments.attachment(id)? {
                Some(a) if !a.is_derivative() && a.mime.starts_with("image/") => images.push(id),
                Some(_) => {}
                None => debug!("Item {} references missing attachment {}", owner.id, id),
            }
        }
        Ok(images)
    }

    /// Worker entry point: claim a queued job and process it
    pub fn run(&self, item: ItemId) -> Result<RunReport> {
        let mut state = self.metadata.job_state(item)?;
        if state.phase != BlurPhase::Queued {
            debug!("Blur job for item {} not queued ({}), skipping", item, state.phase);
            return Ok(RunReport { phase: state.phase, ..Default::default() });
        }

        let owner = match self.metadata.item(item)? {
            Some(owner) if owner.sensitive => owner,
            _ => {
                info!("Item {} is no longer sensitive, dropping blur job", item);
                self.set_phase(item, &mut state, BlurPhase::None)?;
                return Ok(RunReport::default());
            }
        };

        let images = self.enumerate_images(&owner)?;
        let mapping = self.metadata.derivative_mapping(item)?;
        let reused = images.iter().filter(|id| mapping.contains(**id)).count() as u32;

        state.total_images = images.len() as u32;
        state.processed_images = state.processed_images.max(reused).min(state.total_images);
        self.set_phase(item, &mut state, BlurPhase::Processing)?;
        info!(
            "Blur job started for item {}: {} images, {} already blurred",
            item, state.total_images, reused
        );

        let mut report = RunReport { reused, ..Default::default() };
        for original in images {
            if self.metadata.derivative_mapping(item)?.contains(original) {
                continue;
            }

            match self.metadata.job_state(item)?.phase {
                BlurPhase::Processing => {}
                BlurPhase::Stopping => return self.finish_stopped(item, state, report),
                phase => {
                    info!("Blur job for item {} reset to {} while running", item, phase);
                    return Ok(RunReport { phase, ..report });
                }
            }

            match self.blur_one(item, original) {
                Ok(blurred) => {
                    let phase = self.metadata.job_state(item)?.phase;
                    if !matches!(phase, BlurPhase::Processing | BlurPhase::Stopping) {
                        info!("Blur job for item {} reset to {} while blurring {}", item, phase, original);
                        self.discard(original, blurred);
                        return Ok(RunReport { phase, ..report });
                    }

                    let mut mapping = self.metadata.derivative_mapping(item)?;
                    mapping.insert(original, blurred);
                    self.metadata.set_derivative_mapping(item, &mapping)?;

                    state.processed_images = (state.processed_images + 1).min(state.total_images);
                    state.phase = self.metadata.job_state(item)?.phase;
                    self.metadata.set_job_state(item, &state)?;
                    report.blurred += 1;
                    debug!(
                        "Item {}: blurred {} -> {} ({}/{})",
                        item, original, blurred, state.processed_images, state.total_images
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Item {}: failed to blur attachment {}: {}", item, original, e);
                }
            }
        }

        let current = self.metadata.job_state(item)?;
        if current.phase == BlurPhase::None {
            return Ok(RunReport { phase: BlurPhase::None, ..report });
        }
        state.phase = BlurPhase::Processing;
        self.set_phase(item, &mut state, BlurPhase::Complete)?;
        info!(
            "Blur job complete for item {}: {} blurred, {} reused, {} failed",
            item, report.blurred, report.reused, report.failed
        );
        Ok(RunReport { phase: BlurPhase::Complete, ..report })
    }

    fn finish_stopped(&self, item: ItemId, mut state: BlurJobState, report: RunReport) -> Result<RunReport> {
        state.phase = BlurPhase::None;
        state.queued_at = None;
        self.metadata.set_job_state(item, &state)?;
        info!(
            "Blur job for item {} stopped after {}/{} images",
            item, state.processed_images, state.total_images
        );
        Ok(RunReport { phase: BlurPhase::None, ..report })
    }

    /// Drop a derivative produced after its job was purged
    fn discard(&self, original: AttachmentId, blurred: AttachmentId) {
        if let Err(e) = self.attachments.delete(blurred) {
            warn!("Failed to delete orphaned derivative {}: {}", blurred, e);
        }
        if let Err(e) = self.cache.purge_purpose(original, DerivativePurpose::Blur) {
            warn!("Failed to drop cached blur of {}: {}", original, e);
        }
    }

    /// Blur one original into the cache and register the derivative
    fn blur_one(&self, item: ItemId, original: AttachmentId) -> Result<AttachmentId> {
        let source = self.attachments.read(original)?;
        let format = imaging::sniff(&source)?;
        let engine = self.engine;
        let cached = self.cache.get_or_create(&CacheKey::blur(original), imaging::extension(format), || {
            Ok(engine.blur_bytes(&source)?.bytes)
        })?;
        let derived = self
            .attachments
            .insert_derivative(original, item, &cached.path, imaging::mime_type(format))?;
        Ok(derived)
    }
}
