use crate::{*, util::*};
use std::{sync::{Arc, Mutex, Condvar}, thread::{self, JoinHandle}, collections::VecDeque};

type Job = Box<dyn FnOnce() + Send>;

struct Queue {
    jobs: Mutex<VecDeque<Job>>,
    wake: Condvar,
}

// Fixed pool of worker threads taking jobs from one FIFO queue. Used for down-sampling.
pub struct Executor {
    pub num_threads: usize,
    queue: Arc<Queue>,
    threads: Vec<JoinHandle<()>>,
}

impl Executor {
    // No threads; jobs run inline on the calling thread.
    pub fn invalid() -> Self { Self {num_threads: 0, queue: Arc::new(Queue {jobs: Mutex::new(VecDeque::new()), wake: Condvar::new()}), threads: Vec::new()} }

    pub fn new(num_threads: usize) -> Self {
        assert!(num_threads > 0);
        let mut exec = Self::invalid();
        exec.num_threads = num_threads;
        for i in 0..num_threads {
            let queue = exec.queue.clone();
            exec.threads.push(thread::Builder::new().name(format!("vizworker{}", i)).spawn(move || Self::worker_thread(queue)).unwrap());
        }
        exec
    }

    pub fn add<F: FnOnce() + Send + 'static>(&self, f: F) {
        if self.num_threads == 0 {
            f();
            return;
        }
        self.queue.jobs.lock().unwrap().push_back(Box::new(f));
        self.queue.wake.notify_one();
    }

    // Like add(), but the job is counted by `group`, and group.wait() won't return until it's done.
    pub fn add_to_group<F: FnOnce() + Send + 'static>(&self, group: &TaskGroup, f: F) {
        *group.shared.remaining.lock().unwrap() += 1;
        let shared = group.shared.clone();
        self.add(move || {
            // Count the job as finished even if it panics, otherwise wait() would hang forever.
            defer! { shared.finish_one(); }
            f();
        });
    }

    // Workers live as long as the process; they're idle on the condvar when there's nothing to do.
    fn worker_thread(queue: Arc<Queue>) {
        loop {
            let job = {
                let mut jobs = queue.jobs.lock().unwrap();
                loop {
                    match jobs.pop_front() {
                        Some(j) => break j,
                        None => jobs = queue.wake.wait(jobs).unwrap(),
                    }
                }
            };
            job();
        }
    }
}

// A set of tasks to wait for. Used as a full barrier: everything submitted through add_to_group() has completed when wait() returns.
pub struct TaskGroup {
    shared: Arc<GroupShared>,
}

struct GroupShared {
    remaining: Mutex<usize>,
    done: Condvar,
}

impl GroupShared {
    fn finish_one(&self) {
        let mut lock = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        *lock -= 1;
        if *lock == 0 {
            self.done.notify_all();
        }
    }
}

impl TaskGroup {
    pub fn new() -> Self { Self {shared: Arc::new(GroupShared {remaining: Mutex::new(0), done: Condvar::new()})} }

    pub fn wait(&self) {
        let mut lock = self.shared.remaining.lock().unwrap();
        while *lock != 0 {
            lock = self.shared.done.wait(lock).unwrap();
        }
    }

    pub fn remaining(&self) -> usize {
        *self.shared.remaining.lock().unwrap()
    }
}
