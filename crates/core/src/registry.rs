//! In-memory job registry (`JobConfig`).
//!
//! The registry is the value that crosses process boundaries: it is loaded
//! from and saved to a `ConfigStorage` under that storage's lock. Mutating a
//! loaded copy without saving it changes nothing for other processes.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{BatchError, BatchResult};
use crate::id::JobNumId;
use crate::job::Job;

/// All registered jobs, with an identifier ↔ numeric id bijection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RegistrySnapshot", into = "RegistrySnapshot")]
pub struct JobConfig {
    jobs: BTreeMap<JobNumId, Job>,
    ids: HashMap<String, JobNumId>,
    next_id: JobNumId,
}

/// Wire form: the identifier index is rebuilt on load so it can never drift
/// from the job list.
#[derive(Serialize, Deserialize)]
struct RegistrySnapshot {
    next_id: JobNumId,
    jobs: Vec<Job>,
}

impl From<RegistrySnapshot> for JobConfig {
    fn from(snapshot: RegistrySnapshot) -> Self {
        let mut config = JobConfig::new();
        for job in snapshot.jobs {
            config.ids.insert(job.identifier.clone(), job.id);
            if job.id >= config.next_id {
                // Saturates at the last id; `register_job` sees it is taken.
                config.next_id = job.id.next().unwrap_or(job.id);
            }
            config.jobs.insert(job.id, job);
        }
        if snapshot.next_id > config.next_id {
            config.next_id = snapshot.next_id;
        }
        config
    }
}

impl From<JobConfig> for RegistrySnapshot {
    fn from(config: JobConfig) -> Self {
        Self {
            next_id: config.next_id,
            jobs: config.jobs.into_values().collect(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl JobConfig {
    pub fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
            ids: HashMap::new(),
            next_id: JobNumId::FIRST,
        }
    }

    /// Register `identifier`, building its job through `factory`.
    ///
    /// An unseen identifier gets the next sequential id. A known identifier
    /// keeps its id; the factory still runs so that new options replace the
    /// old ones. The factory receives the id because every process rebuilds
    /// its jobs independently from the same numbers.
    ///
    /// Fails without touching the registry once every id is taken.
    pub fn register_job<F>(&mut self, identifier: &str, factory: F) -> BatchResult<JobNumId>
    where
        F: FnOnce(JobNumId) -> Job,
    {
        if identifier.trim().is_empty() {
            return Err(BatchError::registration("job identifier must not be empty"));
        }

        let id = match self.ids.get(identifier) {
            Some(id) => *id,
            None => {
                let id = self.next_id;
                if self.jobs.contains_key(&id) {
                    return Err(BatchError::registration("job id space exhausted"));
                }
                self.next_id = id.next().unwrap_or(id);
                id
            }
        };

        let mut job = factory(id);
        job.id = id;
        job.identifier = identifier.to_string();

        self.ids.insert(identifier.to_string(), id);
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn get_job_from_id(&self, identifier: &str) -> Option<&Job> {
        self.ids.get(identifier).and_then(|id| self.jobs.get(id))
    }

    pub fn get_job_from_id_num(&self, id: JobNumId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// All jobs, ordered by numeric id.
    pub fn get_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn batching(id: JobNumId, options: &JobOptions) -> Job {
        Job::batching(id, "", "flush", options)
    }

    #[test]
    fn assigns_sequential_ids() {
        let mut config = JobConfig::new();
        let options = JobOptions::default();

        let a = config.register_job("a", |id| batching(id, &options)).unwrap();
        let b = config.register_job("b", |id| batching(id, &options)).unwrap();

        assert_eq!(a, JobNumId::new(1));
        assert_eq!(b, JobNumId::new(2));
        assert_eq!(config.get_job_from_id("b").unwrap().id, b);
        assert_eq!(config.get_job_from_id_num(a).unwrap().identifier, "a");
        assert!(config.get_job_from_id("c").is_none());
        assert!(config.get_job_from_id_num(JobNumId::new(9)).is_none());
    }

    #[test]
    fn reregistering_keeps_id_and_refreshes_options() {
        let mut config = JobConfig::new();
        let first = JobOptions::default().with_batch_size(5);
        let second = JobOptions::default().with_batch_size(50);

        let id = config.register_job("emails", |id| batching(id, &first)).unwrap();
        config.register_job("other", |id| batching(id, &first)).unwrap();
        let again = config.register_job("emails", |id| batching(id, &second)).unwrap();

        assert_eq!(id, again);
        assert_eq!(config.len(), 2);
        let policy = config.get_job_from_id("emails").unwrap().batch_policy().unwrap();
        assert_eq!(policy.batch_size(), 50);
    }

    #[test]
    fn empty_identifier_is_rejected() {
        let mut config = JobConfig::new();
        let options = JobOptions::default();
        let result = config.register_job("  ", |id| batching(id, &options));
        assert!(matches!(result, Err(BatchError::Registration(_))));
        assert!(config.is_empty());
    }

    #[test]
    fn snapshot_round_trip_preserves_jobs() {
        let mut config = JobConfig::new();
        let options = JobOptions::default()
            .with_batch_size(3)
            .with_call_period(Duration::from_millis(2_500))
            .with_num_workers(2)
            .with_bootstrap("warm_cache");
        config.register_job("emails", |id| batching(id, &options)).unwrap();
        config
            .register_job("consumer", |id| Job::simple(id, "", "poll", &options))
            .unwrap();

        let encoded = serde_json::to_vec(&config).unwrap();
        let decoded: JobConfig = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, config);

        // Ids keep counting from where the saved registry stopped.
        let mut decoded = decoded;
        let next = decoded.register_job("new", |id| batching(id, &options)).unwrap();
        assert_eq!(next, JobNumId::new(3));
    }

    #[test]
    fn last_id_is_usable_and_then_registration_fails() {
        let options = JobOptions::default();
        let mut config = JobConfig::new();
        config.next_id = JobNumId::new(u32::MAX - 1);

        let a = config.register_job("a", |id| batching(id, &options)).unwrap();
        let b = config.register_job("b", |id| batching(id, &options)).unwrap();
        assert_eq!(a, JobNumId::new(u32::MAX - 1));
        assert_eq!(b, JobNumId::new(u32::MAX));

        let before = config.clone();
        let err = config.register_job("c", |id| batching(id, &options)).unwrap_err();
        assert!(matches!(err, BatchError::Registration(_)));
        assert_eq!(config, before);

        // Known identifiers can still be refreshed.
        assert_eq!(config.register_job("a", |id| batching(id, &options)).unwrap(), a);

        // A reloaded snapshot is just as full.
        let mut reloaded: JobConfig =
            serde_json::from_slice(&serde_json::to_vec(&config).unwrap()).unwrap();
        assert!(matches!(
            reloaded.register_job("c", |id| batching(id, &options)),
            Err(BatchError::Registration(_))
        ));
        assert_eq!(reloaded.get_job_from_id("b").unwrap().id, b);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: distinct identifiers get strictly increasing ids, and
        /// registering any of them again changes nothing about the id set.
        #[test]
        fn ids_are_increasing_and_stable(
            names in prop::collection::vec("[a-z]{1,8}", 1..20),
            repeats in prop::collection::vec(any::<prop::sample::Index>(), 0..20)
        ) {
            let options = JobOptions::default();
            let mut config = JobConfig::new();
            let mut seen = HashSet::new();
            let mut last: Option<JobNumId> = None;
            let mut assigned = Vec::new();

            for name in &names {
                let id = config.register_job(name, |id| batching(id, &options)).unwrap();
                if seen.insert(name.clone()) {
                    if let Some(prev) = last {
                        prop_assert!(id > prev);
                    }
                    last = Some(id);
                    assigned.push((name.clone(), id));
                }
            }

            for index in repeats {
                let (name, id) = &assigned[index.index(assigned.len())];
                let again = config.register_job(name, |id| batching(id, &options)).unwrap();
                prop_assert_eq!(again, *id);
            }

            prop_assert_eq!(config.len(), seen.len());
        }

        /// Property: save(load()) round-trips job set, ids and options.
        #[test]
        fn snapshot_is_idempotent(
            sizes in prop::collection::vec((1usize..1_000, 1u64..10_000, 1u32..8), 0..12)
        ) {
            let mut config = JobConfig::new();
            for (i, (size, millis, workers)) in sizes.iter().enumerate() {
                let options = JobOptions::default()
                    .with_batch_size(*size)
                    .with_call_period(Duration::from_millis(*millis))
                    .with_num_workers(*workers);
                config
                    .register_job(&format!("job-{i}"), |id| batching(id, &options))
                    .unwrap();
            }

            let once: JobConfig = serde_json::from_slice(&serde_json::to_vec(&config).unwrap()).unwrap();
            let twice: JobConfig = serde_json::from_slice(&serde_json::to_vec(&once).unwrap()).unwrap();
            prop_assert_eq!(&once, &config);
            prop_assert_eq!(&twice, &once);
        }
    }
}
