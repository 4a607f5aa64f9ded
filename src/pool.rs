use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use tracing::{debug, warn};

/// Runs `work` over every job on at most `width` named threads and hands each
/// result to `complete` on the calling thread, in completion order.
///
/// A panicking job is delivered as `Err(message)`; siblings keep running.
pub fn run<J, R, W, C>(jobs: Vec<J>, width: usize, work: W, mut complete: C)
where
    J: Send,
    R: Send,
    W: Fn(&J) -> R + Sync,
    C: FnMut(J, Result<R, String>),
{
    if jobs.is_empty() {
        return;
    }
    let width = width.clamp(1, jobs.len());
    let queue = Mutex::new(jobs.into_iter().collect::<VecDeque<J>>());
    let (sender, receiver) = mpsc::channel::<(J, Result<R, String>)>();

    thread::scope(|scope| {
        let mut spawned = 0;
        for slot in 0..width {
            let sender = sender.clone();
            let queue = &queue;
            let work = &work;
            let handle = thread::Builder::new()
                .name(format!("fetch-{slot}"))
                .spawn_scoped(scope, move || {
                    while let Some(job) = next_job(queue) {
                        let result = execute(work, &job);
                        if sender.send((job, result)).is_err() {
                            break;
                        }
                    }
                });
            match handle {
                Ok(_) => spawned += 1,
                Err(err) => warn!(slot, error = %err, "failed to spawn worker thread"),
            }
        }
        drop(sender);
        debug!(workers = spawned, "worker pool started");

        if spawned == 0 {
            // No threads at all: drain the queue here so nothing is lost.
            while let Some(job) = next_job(&queue) {
                let result = execute(&work, &job);
                complete(job, result);
            }
            return;
        }

        for (job, result) in receiver {
            complete(job, result);
        }
    });
}

fn next_job<J>(queue: &Mutex<VecDeque<J>>) -> Option<J> {
    match queue.lock() {
        Ok(mut guard) => guard.pop_front(),
        Err(poisoned) => poisoned.into_inner().pop_front(),
    }
}

fn execute<J, R, W>(work: &W, job: &J) -> Result<R, String>
where
    W: Fn(&J) -> R,
{
    panic::catch_unwind(AssertUnwindSafe(|| work(job))).map_err(panic_message)
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn every_job_completes_once() {
        let mut seen = Vec::new();
        run((0..20).collect(), 4, |job: &i32| job * 2, |job, result| {
            assert_eq!(result.unwrap(), job * 2);
            seen.push(job);
        });
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn width_bounds_concurrency() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        run(
            (0..12).collect::<Vec<u32>>(),
            3,
            |_| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
                active.fetch_sub(1, Ordering::SeqCst);
            },
            |_, _| {},
        );
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn panic_becomes_error_and_siblings_finish() {
        let mut ok = HashSet::new();
        let mut failed = Vec::new();
        run(
            vec!["a", "boom", "c"],
            2,
            |job: &&str| {
                if *job == "boom" {
                    panic!("bad record {job}");
                }
                job.len()
            },
            |job, result| match result {
                Ok(_) => {
                    ok.insert(job);
                }
                Err(message) => failed.push((job, message)),
            },
        );
        assert_eq!(ok, HashSet::from(["a", "c"]));
        assert_eq!(failed, vec![("boom", "bad record boom".to_string())]);
    }

    #[test]
    fn workers_are_named() {
        let mut names = Vec::new();
        run(
            vec![()],
            1,
            |_| thread::current().name().map(str::to_string),
            |_, result| names.push(result.unwrap()),
        );
        assert_eq!(names, vec![Some("fetch-0".to_string())]);
    }
}
