//! Segmentation of the orchestrator's step list along lifecycle phases.
//!
//! The engine splits a module's ordered steps into the clean prefix, the
//! cached range covered by a build record, and the post-cached suffix that
//! still has to run. Phase names and their ordering come from the
//! orchestrator through the [`Lifecycles`] provider.

use crate::{
    error::{CacheError, Result},
    exec::Step,
    model::ModuleId,
};
use std::{
    collections::HashMap,
    sync::Mutex,
};

/// Maps phase names to a global ordering and classifies clean phases.
pub trait Lifecycles {
    /// The global ordinal of the phase across all lifecycles, if known.
    fn ordinal(&self, phase: &str) -> Option<usize>;

    /// Whether the phase belongs to the clean lifecycle.
    fn is_clean_phase(&self, phase: &str) -> bool;
}

/// The conventional clean / default / site phase ordering, usable
/// stand-alone and in tests when the orchestrator supplies nothing else.
#[derive(Debug)]
pub struct StandardLifecycles {
    ordinals: HashMap<&'static str, usize>,
}

const CLEAN_PHASES: &[&str] = &["pre-clean", "clean", "post-clean"];

const DEFAULT_PHASES: &[&str] = &[
    "validate",
    "initialize",
    "generate-sources",
    "process-sources",
    "generate-resources",
    "process-resources",
    "compile",
    "process-classes",
    "generate-test-sources",
    "process-test-sources",
    "generate-test-resources",
    "process-test-resources",
    "test-compile",
    "process-test-classes",
    "test",
    "prepare-package",
    "package",
    "pre-integration-test",
    "integration-test",
    "post-integration-test",
    "verify",
    "install",
    "deploy",
];

const SITE_PHASES: &[&str] = &["pre-site", "site", "post-site", "site-deploy"];

impl Default for StandardLifecycles {
    fn default() -> Self {
        let mut ordinals = HashMap::new();
        for phase in CLEAN_PHASES.iter().chain(DEFAULT_PHASES).chain(SITE_PHASES) {
            let next = ordinals.len();
            ordinals.insert(*phase, next);
        }
        Self { ordinals }
    }
}

impl Lifecycles for StandardLifecycles {
    fn ordinal(&self, phase: &str) -> Option<usize> {
        self.ordinals.get(phase).copied()
    }

    fn is_clean_phase(&self, phase: &str) -> bool {
        CLEAN_PHASES.contains(&phase)
    }
}

/// Partitions a step list against a phase ordering.
pub struct LifecycleSegmenter<'a> {
    lifecycles: &'a dyn Lifecycles,
}

impl<'a> LifecycleSegmenter<'a> {
    pub fn new(lifecycles: &'a dyn Lifecycles) -> Self {
        Self { lifecycles }
    }

    /// Steps bound to the clean lifecycle, in order.
    pub fn clean_segment<'s>(&self, steps: &'s [Step]) -> Vec<&'s Step> {
        steps
            .iter()
            .filter(|s| s.phase.as_deref().is_some_and(|p| self.lifecycles.is_clean_phase(p)))
            .collect()
    }

    /// Steps covered by a record whose highest completed phase is
    /// `highest_phase`: post-clean steps at or before that phase.
    pub fn cached_segment<'s>(
        &self,
        steps: &'s [Step],
        highest_phase: &str,
    ) -> Result<Vec<&'s Step>> {
        let limit = self.ordinal_of(highest_phase)?;
        let mut cached = Vec::new();
        for step in steps {
            let Some(phase) = step.phase.as_deref() else { continue };
            if self.lifecycles.is_clean_phase(phase) {
                continue;
            }
            if self.ordinal_of(phase)? <= limit {
                cached.push(step);
            }
        }
        Ok(cached)
    }

    /// The suffix after [`Self::cached_segment`]: steps bound past the
    /// record's highest completed phase.
    pub fn post_cached_segment<'s>(
        &self,
        steps: &'s [Step],
        highest_phase: &str,
    ) -> Result<Vec<&'s Step>> {
        let limit = self.ordinal_of(highest_phase)?;
        let mut rest = Vec::new();
        for step in steps {
            let Some(phase) = step.phase.as_deref() else { continue };
            if self.ordinal_of(phase)? > limit {
                rest.push(step);
            }
        }
        Ok(rest)
    }

    /// The steps a rebuild executes: steps with no phase of their own and
    /// steps bound past the clean lifecycle.
    pub fn non_clean_segment<'s>(&self, steps: &'s [Step]) -> Vec<&'s Step> {
        steps
            .iter()
            .filter(|s| !s.phase.as_deref().is_some_and(|p| self.lifecycles.is_clean_phase(p)))
            .collect()
    }

    /// Whether `a` is ordered strictly after `b`. Both phases must exist
    /// in some lifecycle.
    pub fn is_later_phase(&self, a: &str, b: &str) -> Result<bool> {
        Ok(self.ordinal_of(a)? > self.ordinal_of(b)?)
    }

    /// The last completed phase among the given steps, by ordinal.
    pub fn highest_phase<'s>(&self, steps: &'s [Step]) -> Result<Option<&'s str>> {
        let mut highest: Option<(usize, &str)> = None;
        for step in steps {
            let Some(phase) = step.phase.as_deref() else { continue };
            let ordinal = self.ordinal_of(phase)?;
            if highest.map_or(true, |(max, _)| ordinal > max) {
                highest = Some((ordinal, phase));
            }
        }
        Ok(highest.map(|(_, phase)| phase))
    }

    fn ordinal_of(&self, phase: &str) -> Result<usize> {
        self.lifecycles.ordinal(phase).ok_or_else(|| CacheError::Phase(phase.to_string()))
    }
}

#[derive(Debug, Default)]
struct ForkState {
    /// Originating phases of currently open forks, innermost last.
    stack: Vec<Option<String>>,
    /// Sticky once any fork was observed during the run.
    forked: bool,
}

/// Per-module record of forked executions, fed by the orchestrator's
/// lifecycle callbacks.
///
/// A module that saw any fork is treated as non-lifecycle for the whole
/// run: no clean prefix is executed and no cache lookup is performed.
#[derive(Debug, Default)]
pub struct ForkTracker {
    state: Mutex<HashMap<String, ForkState>>,
}

impl ForkTracker {
    pub fn forked_project_started(&self, module: &ModuleId, originating_phase: Option<&str>) {
        let mut state = self.state.lock().expect("fork tracker poisoned");
        let entry = state.entry(module.key()).or_default();
        entry.stack.push(originating_phase.map(str::to_string));
        entry.forked = true;
        debug!(module = %module, phase = originating_phase.unwrap_or("<none>"), "forked execution started");
    }

    pub fn forked_project_succeeded(&self, module: &ModuleId) {
        self.pop(module);
    }

    pub fn forked_project_failed(&self, module: &ModuleId) {
        self.pop(module);
    }

    fn pop(&self, module: &ModuleId) {
        let mut state = self.state.lock().expect("fork tracker poisoned");
        if let Some(entry) = state.get_mut(&module.key()) {
            entry.stack.pop();
        }
    }

    /// Whether the module saw a forked execution at any point of the run.
    pub fn is_forked(&self, module: &ModuleId) -> bool {
        let state = self.state.lock().expect("fork tracker poisoned");
        state.get(&module.key()).is_some_and(|e| e.forked)
    }

    /// The originating phase of the innermost open fork, used for steps
    /// that carry no phase of their own.
    pub fn originating_phase(&self, module: &ModuleId) -> Option<String> {
        let state = self.state.lock().expect("fork tracker poisoned");
        state.get(&module.key()).and_then(|e| e.stack.last().cloned()).flatten()
    }
}
