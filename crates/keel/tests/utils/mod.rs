use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use keel::Task;

pub struct RecordTask {
    id: usize,
    log: Arc<Mutex<Vec<usize>>>,
}

impl Task for RecordTask {
    fn process(&self) {
        self.log.lock().unwrap().push(self.id);
    }
}

#[derive(Default)]
pub struct CountTask {
    pub count: AtomicUsize,
}

impl Task for CountTask {
    fn process(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn given_recorded_tasks(count: usize) -> (Vec<Arc<RecordTask>>, Arc<Mutex<Vec<usize>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let tasks = (0..count)
        .map(|id| {
            Arc::new(RecordTask {
                id,
                log: log.clone(),
            })
        })
        .collect();

    (tasks, log)
}

pub fn then_eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);

    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(1));
    }
}
