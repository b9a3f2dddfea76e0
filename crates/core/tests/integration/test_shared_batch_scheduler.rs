//! Integration tests for the shared batch scheduler: admission control,
//! batch formation, splitting, ordering and timeouts

use crossbeam::channel::{self, Receiver, Sender};
use modelserve_core::batching::{
    Batch, BatchQueue, BatchTask, ProcessBatchFn, QueueOptions, SchedulerOptions,
    SharedBatchScheduler, SplitInputTaskFn,
};
use modelserve_core::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
struct TestTask {
    id: usize,
    size: usize,
}

impl BatchTask for TestTask {
    fn size(&self) -> usize {
        self.size
    }
}

fn task(id: usize, size: usize) -> TestTask {
    TestTask { id, size }
}

fn scheduler(threads: usize) -> Arc<SharedBatchScheduler<TestTask>> {
    SharedBatchScheduler::new(SchedulerOptions {
        num_batch_threads: threads,
        thread_pool_name: "test_batch_threads".to_string(),
    })
    .expect("Failed to start scheduler")
}

/// Process callback that reports each batch's tasks
fn recording() -> (ProcessBatchFn<TestTask>, Receiver<Vec<TestTask>>) {
    let (tx, rx) = channel::unbounded();
    let process: ProcessBatchFn<TestTask> = Arc::new(move |batch: Batch<TestTask>| {
        let _ = tx.send(batch.into_tasks());
    });
    (process, rx)
}

/// Process callback that reports when a batch starts, then blocks until
/// released
fn gated() -> (ProcessBatchFn<TestTask>, Receiver<Vec<usize>>, Sender<()>) {
    let (started_tx, started_rx) = channel::unbounded();
    let (release_tx, release_rx) = channel::unbounded::<()>();
    let process: ProcessBatchFn<TestTask> = Arc::new(move |batch: Batch<TestTask>| {
        let _ = started_tx.send(batch.tasks().iter().map(|t| t.id).collect());
        let _ = release_rx.recv();
    });
    (process, started_rx, release_tx)
}

fn ids(tasks: &[TestTask]) -> Vec<usize> {
    tasks.iter().map(|t| t.id).collect()
}

fn long_timeout_queue(
    scheduler: &SharedBatchScheduler<TestTask>,
    max_batch_size: usize,
    max_enqueued_batches: usize,
    process: ProcessBatchFn<TestTask>,
) -> BatchQueue<TestTask> {
    scheduler
        .add_queue(
            QueueOptions {
                max_batch_size,
                batch_timeout: Duration::from_secs(60),
                max_enqueued_batches,
                ..Default::default()
            },
            process,
        )
        .expect("Failed to add queue")
}

#[test]
fn test_full_queue_rejects_with_unavailable() {
    let scheduler = scheduler(1);
    let (process, started, release) = gated();
    let queue = long_timeout_queue(&scheduler, 2, 1, process);

    queue.schedule(task(0, 1)).unwrap();
    queue.schedule(task(1, 1)).unwrap();
    assert_eq!(started.recv_timeout(RECV_TIMEOUT).unwrap(), vec![0, 1]);

    // The executing batch no longer counts; one more batch fits.
    queue.schedule(task(2, 1)).unwrap();
    queue.schedule(task(3, 1)).unwrap();
    assert_eq!(queue.scheduling_capacity(), 0);

    let err = queue.schedule(task(4, 1)).unwrap_err();
    assert!(matches!(err, Error::Unavailable(_)));
    assert!(err.is_admission_failure());
    assert_eq!(queue.num_enqueued_tasks(), 2);

    release.send(()).unwrap();
    assert_eq!(started.recv_timeout(RECV_TIMEOUT).unwrap(), vec![2, 3]);
    queue.schedule(task(5, 1)).unwrap();
    release.send(()).unwrap();
}

#[test]
fn test_single_unit_stream_forms_full_batches() {
    let scheduler = scheduler(2);
    let (process, rx) = recording();
    let queue = long_timeout_queue(&scheduler, 4, 100, process);

    for id in 0..10 {
        queue.schedule(task(id, 1)).unwrap();
    }
    drop(queue);

    let batches: Vec<Vec<usize>> = (0..3)
        .map(|_| ids(&rx.recv_timeout(RECV_TIMEOUT).unwrap()))
        .collect();
    assert_eq!(
        batches,
        vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
    );
}

#[test]
fn test_batches_of_one_queue_run_in_order() {
    let scheduler = scheduler(4);
    let (tx, rx) = channel::unbounded();
    let process: ProcessBatchFn<TestTask> = Arc::new(move |batch: Batch<TestTask>| {
        // Uneven work so that out-of-order execution would show.
        std::thread::sleep(Duration::from_millis((batch.tasks()[0].id % 3) as u64 * 5));
        let _ = tx.send(ids(batch.tasks()));
    });
    let queue = long_timeout_queue(&scheduler, 2, 100, process);

    for id in 0..20 {
        queue.schedule(task(id, 1)).unwrap();
    }
    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.extend(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    }
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
}

#[test]
fn test_oversized_task_without_splitting_is_invalid() {
    let scheduler = scheduler(1);
    let (process, _rx) = recording();
    let queue = long_timeout_queue(&scheduler, 4, 10, process);

    let err = queue.schedule(task(0, 5)).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert!(matches!(
        queue.schedule(task(1, 0)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_task_that_does_not_fit_starts_new_batch() {
    let scheduler = scheduler(1);
    let (process, rx) = recording();
    let queue = long_timeout_queue(&scheduler, 4, 10, process);

    queue.schedule(task(0, 3)).unwrap();
    queue.schedule(task(1, 2)).unwrap();
    drop(queue);

    assert_eq!(ids(&rx.recv_timeout(RECV_TIMEOUT).unwrap()), vec![0]);
    assert_eq!(ids(&rx.recv_timeout(RECV_TIMEOUT).unwrap()), vec![1]);
}

fn split_by_size() -> SplitInputTaskFn<TestTask> {
    Arc::new(|task: TestTask, first: usize, max: usize| {
        let mut pieces = vec![TestTask {
            id: task.id,
            size: first.min(task.size),
        }];
        let mut left = task.size - pieces[0].size;
        while left > 0 {
            let size = left.min(max);
            pieces.push(TestTask { id: task.id, size });
            left -= size;
        }
        Ok(pieces)
    })
}

#[test]
fn test_large_task_splits_across_batches() {
    let scheduler = scheduler(1);
    let (process, rx) = recording();
    let queue = scheduler
        .add_queue(
            QueueOptions {
                max_batch_size: 2,
                batch_timeout: Duration::from_secs(60),
                max_enqueued_batches: 10,
                enable_large_batch_splitting: true,
                split_input_task_fn: Some(split_by_size()),
            },
            process,
        )
        .unwrap();

    queue.schedule(task(0, 1)).unwrap();
    queue.schedule(task(1, 5)).unwrap();
    drop(queue);

    let batches: Vec<Vec<TestTask>> = (0..3)
        .map(|_| rx.recv_timeout(RECV_TIMEOUT).unwrap())
        .collect();
    assert_eq!(batches[0], vec![task(0, 1), task(1, 1)]);
    assert_eq!(batches[1], vec![task(1, 2)]);
    assert_eq!(batches[2], vec![task(1, 2)]);
}

#[test]
fn test_split_admission_uses_total_capacity() {
    let scheduler = scheduler(1);
    let (process, _started, release) = gated();
    let queue = scheduler
        .add_queue(
            QueueOptions {
                max_batch_size: 2,
                batch_timeout: Duration::from_secs(60),
                max_enqueued_batches: 2,
                enable_large_batch_splitting: true,
                split_input_task_fn: Some(split_by_size()),
            },
            process,
        )
        .unwrap();

    assert_eq!(queue.scheduling_capacity(), 4);
    assert!(matches!(
        queue.schedule(task(0, 5)),
        Err(Error::Unavailable(_))
    ));
    queue.schedule(task(1, 4)).unwrap();
    drop(release);
}

#[test]
fn test_timeout_releases_partial_batch() {
    let scheduler = scheduler(1);
    let (process, rx) = recording();
    let queue = scheduler
        .add_queue(
            QueueOptions {
                max_batch_size: 100,
                batch_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            process,
        )
        .unwrap();

    let start = Instant::now();
    queue.schedule(task(0, 1)).unwrap();
    let batch = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(ids(&batch), vec![0]);
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn test_queues_progress_independently() {
    let scheduler = scheduler(2);
    let (blocked, blocked_started, release) = gated();
    let (process, rx) = recording();
    let slow = long_timeout_queue(&scheduler, 1, 10, blocked);
    let fast = long_timeout_queue(&scheduler, 1, 10, process);
    assert_eq!(scheduler.num_queues(), 2);

    slow.schedule(task(0, 1)).unwrap();
    assert_eq!(blocked_started.recv_timeout(RECV_TIMEOUT).unwrap(), vec![0]);

    fast.schedule(task(1, 1)).unwrap();
    assert_eq!(ids(&rx.recv_timeout(RECV_TIMEOUT).unwrap()), vec![1]);
    release.send(()).unwrap();
}

#[test]
fn test_cancel_leaves_closed_batches_alone() {
    let scheduler = scheduler(1);
    let (process, started, release) = gated();
    let queue = long_timeout_queue(&scheduler, 2, 10, process);

    // First batch executes and blocks; the second closes full; the third
    // stays open.
    queue.schedule(task(0, 2)).unwrap();
    assert_eq!(started.recv_timeout(RECV_TIMEOUT).unwrap(), vec![0]);
    queue.schedule(task(1, 2)).unwrap();
    queue.schedule(task(2, 1)).unwrap();

    assert_eq!(queue.cancel_where(|t| t.id == 1 || t.id == 2), 1);
    assert_eq!(queue.num_enqueued_tasks(), 1);

    release.send(()).unwrap();
    assert_eq!(started.recv_timeout(RECV_TIMEOUT).unwrap(), vec![1]);
    release.send(()).unwrap();
}

#[test]
fn test_dropping_scheduler_flushes_pending_work() {
    let scheduler = scheduler(2);
    let (process, rx) = recording();
    let queue = long_timeout_queue(&scheduler, 8, 10, process);
    queue.schedule(task(0, 1)).unwrap();
    queue.schedule(task(1, 1)).unwrap();

    drop(scheduler);
    assert_eq!(ids(&rx.recv_timeout(RECV_TIMEOUT).unwrap()), vec![0, 1]);
    assert!(matches!(
        queue.schedule(task(2, 1)),
        Err(Error::Unavailable(_))
    ));
}

#[test]
fn test_every_admitted_task_runs_when_scheduler_drops_mid_stream() {
    for _ in 0..20 {
        let scheduler = scheduler(2);
        let (process, rx) = recording();
        let queue = scheduler
            .add_queue(
                QueueOptions {
                    max_batch_size: 4,
                    batch_timeout: Duration::from_secs(60),
                    max_enqueued_batches: 100_000,
                    ..Default::default()
                },
                process,
            )
            .unwrap();

        let producer = std::thread::spawn(move || {
            let mut admitted = 0;
            for id in 0.. {
                match queue.schedule(task(id, 1)) {
                    Ok(()) => admitted += 1,
                    Err(Error::Unavailable(_)) => break,
                    Err(e) => panic!("unexpected error {}", e),
                }
            }
            admitted
        });

        std::thread::sleep(Duration::from_millis(2));
        drop(scheduler);
        let admitted = producer.join().unwrap();

        let executed: usize = rx.try_iter().map(|batch| batch.len()).sum();
        assert_eq!(executed, admitted, "admitted tasks were left behind");
    }
}
