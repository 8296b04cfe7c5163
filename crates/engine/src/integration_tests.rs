//! End-to-end tests for jobs, steps and partition coordination.
//!
//! Tests: Source → Transform → Chunk → Sink, plain and partitioned
//!
//! Verifies:
//! - Chunk boundaries and commit counts
//! - Skip, retry and abort behaviour at every failure site
//! - Partition coverage and sibling isolation
//! - Job status and listener notifications

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use proptest::prelude::*;

    use ledgerbatch_core::{FailureCategory, ItemError, ItemResult};

    use crate::executor::StepState;
    use crate::fault::{AbortReason, Backoff, FailureSite, FaultPolicy};
    use crate::job::{Job, JobStatus, Step};
    use crate::listener::{ListenerEvent, RecordingListener};
    use crate::partition::{KeyDomain, Partition, Partitioner};
    use crate::pool::PoolProfile;
    use crate::stage::{BoxSource, BoxTransform, FnTransform, IterSource, SharedSink, Sink, Source, StepTemplate};

    /// Sink that records every committed batch and fails on demand.
    struct ScriptedSink {
        batches: Mutex<Vec<Vec<u64>>>,
        failures: Mutex<VecDeque<ItemError>>,
    }

    impl ScriptedSink {
        fn new() -> Arc<Self> {
            Self::failing(Vec::new())
        }

        fn failing(failures: Vec<ItemError>) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                failures: Mutex::new(failures.into()),
            })
        }

        fn batches(&self) -> Vec<Vec<u64>> {
            self.batches.lock().unwrap().clone()
        }

        fn batch_lens(&self) -> Vec<usize> {
            self.batches().iter().map(Vec::len).collect()
        }

        fn keys(&self) -> Vec<u64> {
            let mut keys: Vec<u64> = self.batches().into_iter().flatten().collect();
            keys.sort_unstable();
            keys
        }
    }

    impl Sink for ScriptedSink {
        type Item = u64;

        fn write(&self, batch: &[u64]) -> ItemResult<()> {
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    /// Counts calls to `next`, including the final end-of-input.
    struct CountingSource {
        inner: IterSource<u64>,
        pulls: Arc<AtomicUsize>,
    }

    impl Source for CountingSource {
        type Item = u64;

        fn next(&mut self) -> ItemResult<Option<u64>> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            self.inner.next()
        }

        fn skip_current(&mut self) {
            self.inner.skip_current();
        }
    }

    fn shared(sink: &Arc<ScriptedSink>) -> SharedSink<u64> {
        sink.clone()
    }

    fn quick(policy: FaultPolicy) -> FaultPolicy {
        policy.with_backoff(Backoff::none())
    }

    /// Source over `1..=n`, or over the partition's own range.
    fn range_template(
        name: &str,
        n: u64,
        sink: &Arc<ScriptedSink>,
        f: fn(&u64) -> ItemResult<Vec<u64>>,
    ) -> StepTemplate<u64, u64> {
        StepTemplate::new(
            name,
            move |partition: Option<&Partition>| {
                let (lower, upper) = partition.map(|p| (p.lower(), p.upper())).unwrap_or((1, n));
                Ok(Box::new(IterSource::from_items((lower..=upper).collect())) as BoxSource<u64>)
            },
            move || Box::new(FnTransform::new(f)) as BoxTransform<u64, u64>,
            shared(sink),
        )
        .with_policy(quick(FaultPolicy::lenient()))
    }

    fn identity(x: &u64) -> ItemResult<Vec<u64>> {
        Ok(vec![*x])
    }

    fn small_pool() -> PoolProfile {
        PoolProfile::new("test", 2, 3, 2)
    }

    #[test]
    fn twenty_three_items_in_chunks_of_five() {
        let sink = ScriptedSink::new();
        let job = Job::new("scenario-a").with_step(Step::plain(range_template("copy", 23, &sink, identity)));

        let report = job.run();
        let step = &report.steps[0];

        assert_eq!(sink.batch_lens(), vec![5, 5, 5, 5, 3]);
        assert_eq!(step.metrics().read, 23);
        assert_eq!(step.metrics().written, 23);
        assert_eq!(step.metrics().skipped, 0);
        assert_eq!(step.metrics().commits, 5);
        assert_eq!(report.status, JobStatus::Completed);
    }

    #[test]
    fn single_validation_failure_is_skipped() {
        fn reject_seventh(x: &u64) -> ItemResult<Vec<u64>> {
            if *x == 7 {
                Err(ItemError::validation("amount below minimum"))
            } else {
                Ok(vec![*x])
            }
        }

        let sink = ScriptedSink::new();
        let job = Job::new("scenario-b").with_step(Step::plain(range_template("copy", 23, &sink, reject_seventh)));

        let report = job.run();
        let metrics = report.steps[0].metrics();

        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.process_skipped, 1);
        assert_eq!(metrics.written, 22);
        assert!(!sink.keys().contains(&7));
        assert_eq!(report.status, JobStatus::CompletedWithOmissions);
    }

    #[test]
    fn skip_limit_aborts_and_stops_reading() {
        let sink = ScriptedSink::new();
        let pulls = Arc::new(AtomicUsize::new(0));
        let source_pulls = pulls.clone();

        let template = StepTemplate::new(
            "validate",
            move |_: Option<&Partition>| {
                Ok(Box::new(CountingSource {
                    inner: IterSource::from_items((1..=20).collect()),
                    pulls: source_pulls.clone(),
                }) as BoxSource<u64>)
            },
            || {
                Box::new(FnTransform::new(|x: &u64| {
                    if *x <= 15 {
                        Err(ItemError::validation(format!("record {x} rejected")))
                    } else {
                        Ok(vec![*x])
                    }
                })) as BoxTransform<u64, u64>
            },
            shared(&sink),
        )
        .with_policy(quick(FaultPolicy::lenient()));

        let never_run = ScriptedSink::new();
        let job = Job::new("scenario-c")
            .with_step(Step::plain(template))
            .with_step(Step::plain(range_template("after", 5, &never_run, identity)));

        let report = job.run();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.steps.len(), 1);
        assert!(never_run.batches().is_empty());

        let step = &report.steps[0];
        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.metrics().skipped, 10);
        assert_eq!(step.metrics().read, 11);
        assert_eq!(pulls.load(Ordering::SeqCst), 11);
        assert_eq!(step.failures[0].reason, AbortReason::SkipLimitExceeded { limit: 10 });
        assert!(sink.batches().is_empty());
    }

    #[test]
    fn fixed_width_partitions_cover_one_to_hundred() {
        let sink = ScriptedSink::new();
        let step = Step::partitioned(
            range_template("partitioned", 100, &sink, identity),
            Partitioner::fixed_width(25),
            KeyDomain::from_estimate(100).unwrap(),
            4,
            small_pool(),
        );

        let report = Job::new("scenario-d").with_step(step).run();
        let step = &report.steps[0];

        let bounds: Vec<(u64, u64)> = step.partitions.iter().map(|p| (p.lower, p.upper)).collect();
        assert_eq!(bounds, vec![(1, 25), (26, 50), (51, 75), (76, 100)]);
        assert!(step.partitions.iter().all(|p| p.state == StepState::Completed));
        assert_eq!(step.metrics().written, 100);
        assert_eq!(step.metrics().commits, 20);
        assert_eq!(sink.keys(), (1..=100).collect::<Vec<_>>());
        assert!(step.pool.is_some());
        assert_eq!(report.status, JobStatus::Completed);
    }

    #[test]
    fn failed_partition_does_not_cancel_siblings() {
        fn tampered_sixty(x: &u64) -> ItemResult<Vec<u64>> {
            if *x == 60 {
                Err(ItemError::security("signature mismatch"))
            } else {
                Ok(vec![*x])
            }
        }

        let sink = ScriptedSink::new();
        let step = Step::partitioned(
            range_template("partitioned", 100, &sink, tampered_sixty),
            Partitioner::fixed_width(25),
            KeyDomain::from_estimate(100).unwrap(),
            4,
            small_pool(),
        );

        let report = Job::new("siblings").with_step(step).run();
        let step = &report.steps[0];

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(step.state, StepState::Failed);

        let states: Vec<StepState> = step.partitions.iter().map(|p| p.state).collect();
        assert_eq!(
            states,
            vec![StepState::Completed, StepState::Completed, StepState::Failed, StepState::Completed]
        );

        // Partition 2 committed 51..=55, then aborted while 56..=59 were in flight.
        let keys = sink.keys();
        let expected: Vec<u64> = (1..=55).chain(76..=100).collect();
        assert_eq!(keys, expected);

        let failure = &step.failures[0];
        assert_eq!(failure.partition.as_deref(), Some("partition2"));
        assert_eq!(failure.category, Some(FailureCategory::Security));

        let summed: u64 = step.partitions.iter().map(|p| p.metrics.written).sum();
        assert_eq!(step.metrics().written, summed);
        assert_eq!(step.metrics().rolled_back, 1);
    }

    #[test]
    fn panicking_partition_is_reported() {
        fn explode_at_thirty(x: &u64) -> ItemResult<Vec<u64>> {
            if *x == 30 {
                panic!("corrupted row");
            }
            Ok(vec![*x])
        }

        let sink = ScriptedSink::new();
        let step = Step::partitioned(
            range_template("panics", 100, &sink, explode_at_thirty),
            Partitioner::balanced(),
            KeyDomain::new(1, 100).unwrap(),
            4,
            small_pool(),
        );

        let report = Job::new("panic").with_step(step).run();
        let step = &report.steps[0];

        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.failures.len(), 1);
        assert_eq!(step.failures[0].reason, AbortReason::WorkerPanicked);
        assert_eq!(step.failures[0].message, "corrupted row");
        assert_eq!(step.partitions.iter().filter(|p| p.is_completed()).count(), 3);
    }

    #[test]
    fn panicking_plain_step_still_reports() {
        fn explode_at_three(x: &u64) -> ItemResult<Vec<u64>> {
            if *x == 3 {
                panic!("unreadable balance");
            }
            Ok(vec![*x])
        }

        let sink = ScriptedSink::new();
        let listener = Arc::new(RecordingListener::new());
        let report = Job::new("panic")
            .with_listener(listener.clone())
            .with_step(Step::plain(range_template("plain-panic", 10, &sink, explode_at_three)))
            .with_step(Step::plain(range_template("after", 10, &sink, identity)))
            .run();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.steps.len(), 1);
        let step = &report.steps[0];
        assert_eq!(step.state, StepState::Failed);
        assert_eq!(step.failures[0].reason, AbortReason::WorkerPanicked);
        assert_eq!(step.failures[0].message, "unreadable balance");
        assert!(sink.batches().is_empty());

        let events = listener.events();
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[1], ListenerEvent::StepEnded(r) if r.step == "plain-panic" && r.is_failed()));
        assert_eq!(events[2], ListenerEvent::JobEnded(report));
    }

    #[test]
    fn transient_write_failures_are_retried_and_rolled_back() {
        let sink = ScriptedSink::failing(vec![
            ItemError::transient("deadlock detected"),
            ItemError::unknown("connection reset"),
        ]);
        let report = Job::new("write-retry")
            .with_step(Step::plain(range_template("copy", 5, &sink, identity)))
            .run();
        let metrics = report.steps[0].metrics();

        assert_eq!(report.status, JobStatus::Completed);
        assert_eq!(metrics.rolled_back, 2);
        assert_eq!(metrics.retries, 2);
        assert_eq!(metrics.commits, 1);
        assert_eq!(metrics.written, 5);
        assert_eq!(sink.batch_lens(), vec![5]);
    }

    #[test]
    fn rejected_chunk_is_skipped_as_a_whole() {
        let sink = ScriptedSink::failing(vec![ItemError::validation("constraint violated")]);
        let report = Job::new("write-skip")
            .with_step(Step::plain(range_template("copy", 10, &sink, identity)))
            .run();
        let metrics = report.steps[0].metrics();

        assert_eq!(report.status, JobStatus::CompletedWithOmissions);
        assert_eq!(metrics.write_skipped, 5);
        assert_eq!(metrics.skipped, 5);
        assert_eq!(metrics.written, 5);
        assert_eq!(sink.keys(), (6..=10).collect::<Vec<_>>());
    }

    #[test]
    fn strict_policy_aborts_on_persistent_storage_failure() {
        let sink = ScriptedSink::failing(vec![
            ItemError::storage("disk full"),
            ItemError::storage("disk full"),
            ItemError::storage("disk full"),
        ]);
        let template = range_template("balances", 5, &sink, identity).with_policy(quick(FaultPolicy::strict()));
        let report = Job::new("strict").with_step(Step::plain(template)).run();
        let step = &report.steps[0];

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(step.metrics().retries, 2);
        assert_eq!(step.metrics().rolled_back, 3);
        assert_eq!(step.metrics().written, 0);
        assert_eq!(step.failures[0].site, Some(FailureSite::Write));
        assert_eq!(
            step.failures[0].reason,
            AbortReason::NotSkippable {
                category: FailureCategory::Storage
            }
        );
    }

    #[test]
    fn unavailable_source_fails_the_step() {
        let sink = ScriptedSink::new();
        let template = StepTemplate::new(
            "offline",
            |_: Option<&Partition>| -> ItemResult<BoxSource<u64>> { Err(ItemError::storage("table missing")) },
            || Box::new(FnTransform::new(identity)) as BoxTransform<u64, u64>,
            shared(&sink),
        );
        let report = Job::new("offline").with_step(Step::plain(template)).run();

        assert_eq!(report.status, JobStatus::Failed);
        assert_eq!(report.steps[0].failures[0].reason, AbortReason::SourceUnavailable);
    }

    #[test]
    fn listeners_see_every_step_and_the_job_end() {
        let sink = ScriptedSink::new();
        let listener = Arc::new(RecordingListener::new());
        let report = Job::new("observed")
            .with_step(Step::plain(range_template("first", 3, &sink, identity)))
            .with_step(Step::plain(range_template("second", 2, &sink, identity)))
            .with_listener(listener.clone())
            .run();

        let events = listener.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], ListenerEvent::StepStarted("first".into()));
        assert!(matches!(&events[1], ListenerEvent::StepEnded(r) if r.step == "first" && r.metrics().written == 3));
        assert_eq!(events[2], ListenerEvent::StepStarted("second".into()));
        assert!(matches!(&events[3], ListenerEvent::StepEnded(r) if r.step == "second"));
        assert_eq!(events[4], ListenerEvent::JobEnded(report));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: N items with chunk size C commit in ceil(N/C) batches,
        /// none larger than C, the last holding N mod C (or C).
        #[test]
        fn chunks_are_atomic_and_bounded(n in 0u64..200, c in 1usize..20) {
            let sink = ScriptedSink::new();
            // `1..=0` is empty, so n = 0 exercises the no-commit path.
            let template = range_template("chunks", n, &sink, identity);
            let report = Job::new("chunks").with_step(Step::plain(template.with_chunk_size(c))).run();

            let lens = sink.batch_lens();
            let c64 = c as u64;
            prop_assert_eq!(lens.len() as u64, n.div_ceil(c64));
            prop_assert!(lens.iter().all(|&len| len > 0 && len <= c));
            if let Some(&last) = lens.last() {
                let expected = if n % c64 == 0 { c } else { (n % c64) as usize };
                prop_assert_eq!(last, expected);
            }
            prop_assert_eq!(report.steps[0].metrics().written, n);
            prop_assert_eq!(report.steps[0].metrics().commits, lens.len() as u64);
        }

        /// Property: a partitioned run writes every key of the domain exactly once.
        #[test]
        fn partitioned_run_writes_each_key_once(
            lower in 1u64..50,
            span in 0u64..300,
            count in 1usize..8,
            width in prop::option::of(1u64..80),
        ) {
            let sink = ScriptedSink::new();
            let upper = lower + span;
            let partitioner = width.map(Partitioner::fixed_width).unwrap_or_else(Partitioner::balanced);
            let step = Step::partitioned(
                range_template("cover", upper, &sink, identity),
                partitioner,
                KeyDomain::new(lower, upper).unwrap(),
                count,
                small_pool(),
            );

            let report = Job::new("cover").with_step(step).run();

            prop_assert_eq!(report.status, JobStatus::Completed);
            prop_assert_eq!(sink.keys(), (lower..=upper).collect::<Vec<_>>());
            prop_assert!(report.steps[0].partitions.len() <= count);
        }
    }
}
