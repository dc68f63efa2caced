//! The per-(target, stage) state table.
//!
//! The table is owned by the scheduler's task; workers never touch it. It is
//! persisted as JSON so an interrupted run can be resumed.

use crate::core::{JobStatus, Job, Prerequisite, Stage, StageScope, Target};
use crate::errors::{SiteflowError, StateError};
use crate::registry::SiteCode;
use crate::utils::write_atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

const STATE_VERSION: u32 = 1;

/// Scheduling state of one (target, stage) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    /// Current status.
    pub status: JobStatus,
    /// Number of the most recent attempt; 0 before the first submission.
    #[serde(default)]
    pub attempt: u32,
    /// Attempts since the pair was last reopened by an operator.
    #[serde(default)]
    pub round_attempts: u32,
    /// Error of the most recent failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When a failed pair becomes eligible for automatic re-submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl Default for StageState {
    fn default() -> Self {
        Self {
            status: JobStatus::Pending,
            attempt: 0,
            round_attempts: 0,
            last_error: None,
            retry_at: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    target: Target,
    stage: Stage,
    #[serde(flatten)]
    state: StageState,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    saved_at: DateTime<Utc>,
    #[serde(default)]
    excluded: Vec<SiteCode>,
    entries: Vec<PersistedEntry>,
}

/// Explicit state table keyed by (target, stage).
#[derive(Debug, Clone)]
pub struct StateTable {
    sites: Vec<SiteCode>,
    excluded: BTreeSet<SiteCode>,
    entries: BTreeMap<(Target, Stage), StageState>,
}

impl StateTable {
    /// Creates a table with every pair pending, for sites in registry order.
    #[must_use]
    pub fn new(sites: Vec<SiteCode>) -> Self {
        let mut entries = BTreeMap::new();
        for site in &sites {
            for stage in Stage::ALL.into_iter().filter(|s| s.scope() == StageScope::Site) {
                entries.insert((Target::Site(site.clone()), stage), StageState::default());
            }
        }
        for stage in Stage::ALL.into_iter().filter(|s| s.scope() == StageScope::Aggregate) {
            entries.insert((Target::Aggregate, stage), StageState::default());
        }
        Self {
            sites,
            excluded: BTreeSet::new(),
            entries,
        }
    }

    /// Sites in registry order.
    #[must_use]
    pub fn sites(&self) -> &[SiteCode] {
        &self.sites
    }

    /// Sites taking part in the barrier (registry order, exclusions removed).
    #[must_use]
    pub fn participants(&self) -> Vec<SiteCode> {
        self.sites
            .iter()
            .filter(|s| !self.excluded.contains(*s))
            .cloned()
            .collect()
    }

    /// Sites removed by an operator.
    #[must_use]
    pub fn excluded(&self) -> &BTreeSet<SiteCode> {
        &self.excluded
    }

    /// Returns the state of a pair.
    #[must_use]
    pub fn get(&self, target: &Target, stage: Stage) -> Option<&StageState> {
        self.entries.get(&(target.clone(), stage))
    }

    /// Returns the status of a pair; unknown pairs read as pending.
    #[must_use]
    pub fn status(&self, target: &Target, stage: Stage) -> JobStatus {
        self.get(target, stage).map_or(JobStatus::Pending, |s| s.status)
    }

    /// Iterates all pairs, sites in registry order first, then the aggregate.
    pub fn iter(&self) -> impl Iterator<Item = (&Target, Stage, &StageState)> {
        let mut pairs: Vec<_> = self.entries.iter().collect();
        pairs.sort_by_key(|((target, stage), _)| self.order_key(target, *stage));
        pairs.into_iter().map(|((t, s), st)| (t, *s, st))
    }

    fn order_key(&self, target: &Target, stage: Stage) -> (usize, usize) {
        let idx = match target {
            Target::Site(code) => self.sites.iter().position(|s| s == code).unwrap_or(usize::MAX - 1),
            Target::Aggregate => usize::MAX,
        };
        (idx, stage.declaration_index())
    }

    fn entry_mut(&mut self, target: &Target, stage: Stage) -> Result<&mut StageState, SiteflowError> {
        self.entries
            .get_mut(&(target.clone(), stage))
            .ok_or_else(|| SiteflowError::Internal(format!("no state for {target}/{stage}")))
    }

    /// Applies a single status transition.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the transition is not allowed.
    pub fn transition(&mut self, target: &Target, stage: Stage, to: JobStatus) -> Result<(), SiteflowError> {
        let entry = self.entry_mut(target, stage)?;
        if !entry.status.can_transition_to(to) {
            return Err(StateError {
                target: target.clone(),
                stage,
                from: entry.status,
                to,
            }
            .into());
        }
        debug!(site = %target, stage = %stage, from = %entry.status, to = %to, "State transition");
        entry.status = to;
        entry.updated_at = Utc::now();
        if to != JobStatus::Failed {
            entry.retry_at = None;
        }
        Ok(())
    }

    /// Moves a ready pair to running and returns the new attempt number.
    pub fn mark_running(&mut self, target: &Target, stage: Stage) -> Result<u32, SiteflowError> {
        self.transition(target, stage, JobStatus::Running)?;
        let entry = self.entry_mut(target, stage)?;
        entry.attempt += 1;
        entry.round_attempts += 1;
        Ok(entry.attempt)
    }

    /// Records a finished job.
    pub fn record(&mut self, job: &Job) -> Result<(), SiteflowError> {
        self.transition(&job.target, job.stage, job.status)?;
        let entry = self.entry_mut(&job.target, job.stage)?;
        entry.last_error = if job.status == JobStatus::Failed {
            job.error.clone()
        } else {
            None
        };
        Ok(())
    }

    /// Schedules a failed pair for automatic re-submission at `at`.
    pub fn schedule_retry(&mut self, target: &Target, stage: Stage, at: DateTime<Utc>) -> Result<(), SiteflowError> {
        let entry = self.entry_mut(target, stage)?;
        if entry.status != JobStatus::Failed {
            return Err(StateError {
                target: target.clone(),
                stage,
                from: entry.status,
                to: JobStatus::Ready,
            }
            .into());
        }
        entry.retry_at = Some(at);
        Ok(())
    }

    /// Time until the earliest scheduled retry, if any.
    #[must_use]
    pub fn next_retry_in(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.entries
            .values()
            .filter(|s| s.status == JobStatus::Failed)
            .filter_map(|s| s.retry_at)
            .min()
            .map(|at| (at - now).to_std().unwrap_or_default())
    }

    /// Moves failed pairs whose retry time has passed back to ready.
    pub fn release_due_retries(&mut self, now: DateTime<Utc>) -> Vec<(Target, Stage)> {
        let due: Vec<(Target, Stage)> = self
            .entries
            .iter()
            .filter(|(_, s)| s.status == JobStatus::Failed && s.retry_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for (target, stage) in &due {
            if let Some(entry) = self.entries.get_mut(&(target.clone(), *stage)) {
                entry.status = JobStatus::Ready;
                entry.retry_at = None;
                entry.updated_at = now;
            }
        }
        due
    }

    /// True when every prerequisite of the pair is complete.
    ///
    /// An `EverySite` edge is the join barrier: it holds only when the stage
    /// is complete for every participating site.
    #[must_use]
    pub fn prerequisites_met(&self, target: &Target, stage: Stage) -> bool {
        stage.prerequisites().iter().all(|prereq| match prereq {
            Prerequisite::SameSite(s) => self.status(target, *s).is_complete(),
            Prerequisite::Aggregate(s) => self.status(&Target::Aggregate, *s).is_complete(),
            Prerequisite::EverySite(s) => self
                .participants()
                .into_iter()
                .all(|site| self.status(&Target::Site(site), *s).is_complete()),
        })
    }

    /// Sites the consolidation barrier is still waiting on.
    #[must_use]
    pub fn barrier_waiting_on(&self) -> Vec<String> {
        self.participants()
            .into_iter()
            .filter(|site| {
                let target = Target::Site(site.clone());
                Stage::Consolidate.prerequisites().iter().any(|p| !self.status(&target, p.stage()).is_complete())
            })
            .map(|site| site.to_string())
            .collect()
    }

    /// Unmet prerequisites of a pair, as `target/stage` strings.
    #[must_use]
    pub fn unmet_prerequisites(&self, target: &Target, stage: Stage) -> Vec<String> {
        let mut unmet = Vec::new();
        for prereq in stage.prerequisites() {
            let targets: Vec<Target> = match prereq {
                Prerequisite::SameSite(_) => vec![target.clone()],
                Prerequisite::Aggregate(_) => vec![Target::Aggregate],
                Prerequisite::EverySite(_) => self.participants().into_iter().map(Target::Site).collect(),
            };
            for t in targets {
                if !self.status(&t, prereq.stage()).is_complete() {
                    unmet.push(format!("{t}/{}", prereq.stage()));
                }
            }
        }
        unmet
    }

    /// Promotes pending pairs whose prerequisites are complete.
    ///
    /// Pairs of excluded sites are never promoted.
    pub fn promote_ready(&mut self) -> Vec<(Target, Stage)> {
        let promotable: Vec<(Target, Stage)> = self
            .entries
            .iter()
            .filter(|((target, stage), state)| {
                state.status == JobStatus::Pending
                    && !self.is_excluded(target)
                    && self.prerequisites_met(target, *stage)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for (target, stage) in &promotable {
            if let Some(entry) = self.entries.get_mut(&(target.clone(), *stage)) {
                entry.status = JobStatus::Ready;
                entry.updated_at = Utc::now();
            }
        }
        promotable
    }

    /// Ready pairs in submission order: registry order, then stage order.
    #[must_use]
    pub fn ready_in_order(&self) -> Vec<(Target, Stage)> {
        let mut ready: Vec<(Target, Stage)> = self
            .entries
            .iter()
            .filter(|(_, s)| s.status == JobStatus::Ready)
            .map(|(k, _)| k.clone())
            .collect();
        ready.sort_by_key(|(target, stage)| self.order_key(target, *stage));
        ready
    }

    fn is_excluded(&self, target: &Target) -> bool {
        target.site().is_some_and(|s| self.excluded.contains(s))
    }

    /// Every pair that depends on `(target, stage)`, transitively.
    #[must_use]
    pub fn downstream(&self, target: &Target, stage: Stage) -> Vec<(Target, Stage)> {
        let mut found: BTreeSet<(Target, Stage)> = BTreeSet::new();
        let mut frontier = vec![(target.clone(), stage)];
        while let Some((t, s)) = frontier.pop() {
            for dependent in s.dependents() {
                for prereq in dependent.prerequisites().iter().filter(|p| p.stage() == s) {
                    let targets: Vec<Target> = match (prereq, &t) {
                        (Prerequisite::SameSite(_), Target::Site(_)) => vec![t.clone()],
                        (Prerequisite::Aggregate(_), Target::Aggregate) => match dependent.scope() {
                            StageScope::Site => self.sites.iter().cloned().map(Target::Site).collect(),
                            StageScope::Aggregate => vec![Target::Aggregate],
                        },
                        (Prerequisite::EverySite(_), Target::Site(_)) => vec![Target::Aggregate],
                        _ => Vec::new(),
                    };
                    for dt in targets {
                        if found.insert((dt.clone(), dependent)) {
                            frontier.push((dt, dependent));
                        }
                    }
                }
            }
        }
        let mut out: Vec<_> = found.into_iter().collect();
        out.sort_by_key(|(t, s)| self.order_key(t, *s));
        out
    }

    /// Starts a new round for a pair: it returns to pending with a fresh retry
    /// budget, and every downstream pair is reset to pending.
    ///
    /// # Errors
    ///
    /// Fails with [`StateError`] while the pair or a downstream pair is running.
    pub fn reopen(&mut self, target: &Target, stage: Stage) -> Result<Vec<(Target, Stage)>, SiteflowError> {
        let reset = self.reset_from(target, stage)?;
        self.entry_mut(target, stage)?.round_attempts = 0;
        info!(site = %target, stage = %stage, downstream = reset.len() - 1, "Reopened stage");
        Ok(reset)
    }

    /// Like [`reopen`](Self::reopen) but keeps the retry budget; used when
    /// validation sends a site back to preprocessing.
    pub fn resubmit(&mut self, target: &Target, stage: Stage) -> Result<Vec<(Target, Stage)>, SiteflowError> {
        self.reset_from(target, stage)
    }

    fn reset_from(&mut self, target: &Target, stage: Stage) -> Result<Vec<(Target, Stage)>, SiteflowError> {
        let mut pairs = vec![(target.clone(), stage)];
        pairs.extend(self.downstream(target, stage));

        for (t, s) in &pairs {
            let status = self.status(t, *s);
            if status == JobStatus::Running {
                return Err(StateError {
                    target: t.clone(),
                    stage: *s,
                    from: status,
                    to: JobStatus::Pending,
                }
                .into());
            }
        }
        for (t, s) in &pairs {
            let entry = self.entry_mut(t, *s)?;
            entry.status = JobStatus::Pending;
            entry.retry_at = None;
            entry.updated_at = Utc::now();
        }
        Ok(pairs)
    }

    /// Removes a site from the barrier. Operator action only.
    pub fn exclude(&mut self, site: &SiteCode) -> Result<(), SiteflowError> {
        if !self.sites.contains(site) {
            return Err(crate::errors::ConfigError::UnknownSite {
                site: site.to_string(),
            }
            .into());
        }
        if self.excluded.insert(site.clone()) {
            info!(site = %site, "Site excluded from consolidation");
        }
        Ok(())
    }

    /// Returns an excluded site to the barrier.
    ///
    /// Once consolidation has left `pending`, the aggregate no longer matches
    /// the participant set, so consolidation and everything downstream of it
    /// return to pending. Returns false if the site was not excluded.
    ///
    /// # Errors
    ///
    /// Fails with [`StateError`] while consolidation or a downstream pair is
    /// running; the site then stays excluded.
    pub fn include(&mut self, site: &SiteCode) -> Result<bool, SiteflowError> {
        if !self.excluded.contains(site) {
            return Ok(false);
        }
        if self.status(&Target::Aggregate, Stage::Consolidate) != JobStatus::Pending {
            let reset = self.reset_from(&Target::Aggregate, Stage::Consolidate)?;
            info!(site = %site, reset = reset.len(), "Re-included site invalidates consolidation");
        }
        self.excluded.remove(site);
        Ok(true)
    }

    /// Moves a pair to running for a job started outside the scheduler loop
    /// and returns the attempt number.
    ///
    /// Without `force` the pair must be ready. With `force` a pair that is not
    /// ready is reset together with its downstream pairs and submitted anyway.
    ///
    /// # Errors
    ///
    /// Fails with [`StateError`] when the pair is not ready and `force` is
    /// unset, or when the pair or a downstream pair is running.
    pub fn claim(&mut self, target: &Target, stage: Stage, force: bool) -> Result<u32, SiteflowError> {
        self.promote_ready();
        let status = self.status(target, stage);
        if status != JobStatus::Ready {
            if !force {
                return Err(StateError {
                    target: target.clone(),
                    stage,
                    from: status,
                    to: JobStatus::Running,
                }
                .into());
            }
            let reset = self.reset_from(target, stage)?;
            info!(site = %target, stage = %stage, reset = reset.len(), "Forcing stage past its prerequisites");
            self.transition(target, stage, JobStatus::Ready)?;
        }
        self.mark_running(target, stage)
    }

    /// Saves the table as JSON.
    pub fn save(&self, path: &Path) -> Result<(), SiteflowError> {
        let persisted = PersistedState {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            excluded: self.excluded.iter().cloned().collect(),
            entries: self
                .iter()
                .map(|(target, stage, state)| PersistedEntry {
                    target: target.clone(),
                    stage,
                    state: state.clone(),
                })
                .collect(),
        };
        let mut json = serde_json::to_string_pretty(&persisted)?;
        json.push('\n');
        write_atomic(path, json.as_bytes())?;
        Ok(())
    }

    /// Loads a saved table, or starts fresh when no file exists.
    ///
    /// Entries left `running` by an interrupted run become `failed` so they
    /// are re-offered; `ready` entries go back to `pending`. Entries for sites
    /// no longer registered are dropped.
    pub fn load(path: &Path, sites: Vec<SiteCode>) -> Result<Self, SiteflowError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new(sites)),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedState = serde_json::from_str(&text)?;
        if persisted.version != STATE_VERSION {
            return Err(SiteflowError::Serialization(format!(
                "unsupported state version {} in {}",
                persisted.version,
                path.display()
            )));
        }

        let mut table = Self::new(sites);
        for entry in persisted.entries {
            let key = (entry.target, entry.stage);
            let Some(slot) = table.entries.get_mut(&key) else {
                debug!(site = %key.0, stage = %key.1, "Dropping state for unregistered target");
                continue;
            };
            let mut state = entry.state;
            match state.status {
                JobStatus::Running => {
                    state.status = JobStatus::Failed;
                    state.last_error = Some("interrupted".to_string());
                    state.retry_at = None;
                }
                JobStatus::Ready => state.status = JobStatus::Pending,
                _ => {}
            }
            *slot = state;
        }
        table.excluded = persisted
            .excluded
            .into_iter()
            .filter(|s| table.sites.contains(s))
            .collect();
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn code(s: &str) -> SiteCode {
        SiteCode::new(s).unwrap()
    }

    fn site(s: &str) -> Target {
        Target::Site(code(s))
    }

    fn table() -> StateTable {
        StateTable::new(vec![code("a"), code("b")])
    }

    fn run_ok(table: &mut StateTable, target: &Target, stage: Stage) {
        table.promote_ready();
        assert_eq!(table.status(target, stage), JobStatus::Ready, "{target}/{stage}");
        let attempt = table.mark_running(target, stage).unwrap();
        table.record(&Job::start(target.clone(), stage, attempt).complete(Some(0))).unwrap();
    }

    fn run_fail(table: &mut StateTable, target: &Target, stage: Stage) {
        table.promote_ready();
        let attempt = table.mark_running(target, stage).unwrap();
        table.record(&Job::start(target.clone(), stage, attempt).fail(Some(1), "boom")).unwrap();
    }

    #[test]
    fn test_new_table_has_site_and_aggregate_pairs() {
        let table = table();
        assert_eq!(table.iter().count(), 2 * 4 + 4);
        assert_eq!(table.status(&site("a"), Stage::Prepare), JobStatus::Pending);
        assert!(table.get(&Target::Aggregate, Stage::Heatmap).is_none());
    }

    #[test]
    fn test_only_prepare_is_initially_ready_in_registry_order() {
        let mut table = table();
        table.promote_ready();
        assert_eq!(
            table.ready_in_order(),
            vec![(site("a"), Stage::Prepare), (site("b"), Stage::Prepare)]
        );
    }

    #[test]
    fn test_illegal_transition_is_state_error() {
        let mut table = table();
        let err = table.transition(&site("a"), Stage::Prepare, JobStatus::Complete).unwrap_err();
        assert!(matches!(err, SiteflowError::State(_)));
        assert!(table.mark_running(&site("a"), Stage::Prepare).is_err());
    }

    #[test]
    fn test_barrier_waits_for_every_site() {
        let mut table = table();
        for stage in [Stage::Prepare, Stage::Preprocess, Stage::Validate] {
            run_ok(&mut table, &site("a"), stage);
        }
        run_ok(&mut table, &site("b"), Stage::Prepare);
        run_fail(&mut table, &site("b"), Stage::Preprocess);

        table.promote_ready();
        assert_eq!(table.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Pending);
        assert_eq!(table.barrier_waiting_on(), vec!["b"]);
        assert_eq!(
            table.unmet_prerequisites(&Target::Aggregate, Stage::Consolidate),
            vec!["b/preprocess", "b/validate"]
        );
        assert_eq!(table.status(&site("a"), Stage::Validate), JobStatus::Complete);
    }

    #[test]
    fn test_exclude_releases_barrier() {
        let mut table = table();
        for stage in [Stage::Prepare, Stage::Preprocess, Stage::Validate] {
            run_ok(&mut table, &site("a"), stage);
        }
        table.exclude(&code("b")).unwrap();
        table.promote_ready();
        assert_eq!(table.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Ready);
        assert_eq!(table.participants(), vec![code("a")]);
        assert!(table.exclude(&code("zz")).is_err());
    }

    #[test]
    fn test_include_after_consolidation_reopens_aggregate() {
        let mut table = table();
        table.exclude(&code("b")).unwrap();
        for stage in [Stage::Prepare, Stage::Preprocess, Stage::Validate] {
            run_ok(&mut table, &site("a"), stage);
        }
        run_ok(&mut table, &Target::Aggregate, Stage::Consolidate);
        run_ok(&mut table, &Target::Aggregate, Stage::Crossval);

        assert!(table.include(&code("b")).unwrap());
        for stage in [Stage::Consolidate, Stage::Crossval, Stage::Train, Stage::Statistics] {
            assert_eq!(table.status(&Target::Aggregate, stage), JobStatus::Pending);
        }
        assert_eq!(table.participants(), vec![code("a"), code("b")]);
        assert_eq!(table.status(&site("a"), Stage::Validate), JobStatus::Complete);

        table.promote_ready();
        assert!(!table.prerequisites_met(&Target::Aggregate, Stage::Consolidate));
        assert_eq!(table.barrier_waiting_on(), vec!["b"]);
        assert!(!table.include(&code("b")).unwrap());
    }

    #[test]
    fn test_claim_respects_barrier_unless_forced() {
        let mut table = table();
        for stage in [Stage::Prepare, Stage::Preprocess, Stage::Validate] {
            run_ok(&mut table, &site("a"), stage);
        }

        let err = table.claim(&Target::Aggregate, Stage::Consolidate, false).unwrap_err();
        assert!(matches!(err, SiteflowError::State(_)));
        assert_eq!(table.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Pending);

        let attempt = table.claim(&Target::Aggregate, Stage::Consolidate, true).unwrap();
        assert_eq!(attempt, 1);
        assert_eq!(table.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Running);
        table
            .record(&Job::start(Target::Aggregate, Stage::Consolidate, attempt).complete(None))
            .unwrap();
        assert_eq!(table.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Complete);
    }

    #[test]
    fn test_claim_ready_pair_and_force_rerun_of_complete_pair() {
        let mut table = table();
        for s in ["a", "b"] {
            for stage in [Stage::Prepare, Stage::Preprocess, Stage::Validate] {
                run_ok(&mut table, &site(s), stage);
            }
        }
        let attempt = table.claim(&Target::Aggregate, Stage::Consolidate, false).unwrap();
        table
            .record(&Job::start(Target::Aggregate, Stage::Consolidate, attempt).complete(None))
            .unwrap();
        run_ok(&mut table, &Target::Aggregate, Stage::Train);

        assert!(table.claim(&Target::Aggregate, Stage::Consolidate, false).is_err());
        assert_eq!(table.claim(&Target::Aggregate, Stage::Consolidate, true).unwrap(), 2);
        assert_eq!(table.status(&Target::Aggregate, Stage::Train), JobStatus::Pending);
        assert!(table.claim(&Target::Aggregate, Stage::Consolidate, true).is_err());
    }

    #[test]
    fn test_include_refused_while_consolidation_runs() {
        let mut table = table();
        table.exclude(&code("b")).unwrap();
        for stage in [Stage::Prepare, Stage::Preprocess, Stage::Validate] {
            run_ok(&mut table, &site("a"), stage);
        }
        table.promote_ready();
        table.mark_running(&Target::Aggregate, Stage::Consolidate).unwrap();

        assert!(table.include(&code("b")).is_err());
        assert!(table.excluded().contains(&code("b")));
    }

    #[test]
    fn test_reopen_resets_downstream() {
        let mut table = table();
        for s in ["a", "b"] {
            for stage in [Stage::Prepare, Stage::Preprocess, Stage::Validate] {
                run_ok(&mut table, &site(s), stage);
            }
        }
        run_ok(&mut table, &Target::Aggregate, Stage::Consolidate);

        let reset = table.reopen(&site("a"), Stage::Preprocess).unwrap();
        assert!(reset.contains(&(site("a"), Stage::Validate)));
        assert!(reset.contains(&(site("a"), Stage::Heatmap)));
        assert!(reset.contains(&(Target::Aggregate, Stage::Consolidate)));
        assert!(reset.contains(&(Target::Aggregate, Stage::Statistics)));
        assert!(!reset.contains(&(site("b"), Stage::Validate)));

        assert_eq!(table.status(&site("a"), Stage::Preprocess), JobStatus::Pending);
        assert_eq!(table.status(&Target::Aggregate, Stage::Consolidate), JobStatus::Pending);
        assert_eq!(table.status(&site("b"), Stage::Validate), JobStatus::Complete);
        assert_eq!(table.get(&site("a"), Stage::Preprocess).unwrap().round_attempts, 0);
        assert_eq!(table.get(&site("a"), Stage::Preprocess).unwrap().attempt, 1);
    }

    #[test]
    fn test_train_downstream_covers_every_site_heatmap() {
        let table = table();
        let down = table.downstream(&Target::Aggregate, Stage::Train);
        assert_eq!(down, vec![(site("a"), Stage::Heatmap), (site("b"), Stage::Heatmap)]);
    }

    #[test]
    fn test_retry_scheduling() {
        let mut table = table();
        run_fail(&mut table, &site("a"), Stage::Prepare);
        let now = Utc::now();
        table.schedule_retry(&site("a"), Stage::Prepare, now + chrono::Duration::seconds(5)).unwrap();

        assert!(table.release_due_retries(now).is_empty());
        assert!(table.next_retry_in(now).unwrap() <= std::time::Duration::from_secs(5));

        let released = table.release_due_retries(now + chrono::Duration::seconds(6));
        assert_eq!(released, vec![(site("a"), Stage::Prepare)]);
        assert_eq!(table.status(&site("a"), Stage::Prepare), JobStatus::Ready);
        assert_eq!(table.mark_running(&site("a"), Stage::Prepare).unwrap(), 2);
    }

    #[test]
    fn test_save_and_load_normalizes_interrupted_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".siteflow/state.json");

        let mut table = table();
        run_ok(&mut table, &site("a"), Stage::Prepare);
        table.promote_ready();
        table.mark_running(&site("a"), Stage::Preprocess).unwrap();
        table.exclude(&code("b")).unwrap();
        table.save(&path).unwrap();

        let loaded = StateTable::load(&path, vec![code("a"), code("b")]).unwrap();
        assert_eq!(loaded.status(&site("a"), Stage::Prepare), JobStatus::Complete);
        let interrupted = loaded.get(&site("a"), Stage::Preprocess).unwrap();
        assert_eq!(interrupted.status, JobStatus::Failed);
        assert_eq!(interrupted.last_error.as_deref(), Some("interrupted"));
        assert_eq!(loaded.status(&site("b"), Stage::Prepare), JobStatus::Pending);
        assert!(loaded.excluded().contains(&code("b")));

        let shrunk = StateTable::load(&path, vec![code("a")]).unwrap();
        assert!(shrunk.excluded().is_empty());
        assert_eq!(shrunk.iter().count(), 4 + 4);
    }

    #[test]
    fn test_load_missing_file_starts_fresh() {
        let tmp = tempfile::tempdir().unwrap();
        let table = StateTable::load(&tmp.path().join("state.json"), vec![code("a")]).unwrap();
        assert_eq!(table.status(&site("a"), Stage::Prepare), JobStatus::Pending);
    }
}
