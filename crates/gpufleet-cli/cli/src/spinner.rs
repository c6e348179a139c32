use gpufleet_core::ProgressSink;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Creates and configures a new progress spinner with consistent styling
pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

struct Task {
    bar: ProgressBar,
    label: String,
}

/// One spinner per running task, stacked on stderr.
pub struct SpinnerProgress {
    multi: MultiProgress,
    tasks: Mutex<HashMap<String, Task>>,
}

impl SpinnerProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<String, Task>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn println(&self, line: String) {
        // Drawing is best effort; a closed terminal must not fail the run.
        let _ = self.multi.println(line);
    }
}

impl ProgressSink for SpinnerProgress {
    fn start(&self, task: &str, label: &str) {
        let mut tasks = self.tasks();
        match tasks.get_mut(task) {
            Some(existing) => {
                existing.bar.set_message(label.to_string());
                existing.label = label.to_string();
            }
            None => {
                let bar = self.multi.add(create_spinner());
                bar.set_message(label.to_string());
                tasks.insert(
                    task.to_string(),
                    Task {
                        bar,
                        label: label.to_string(),
                    },
                );
            }
        }
    }

    fn update(&self, task: &str, percent: u8) {
        if let Some(running) = self.tasks().get(task) {
            running.bar.set_message(format!("{} ({}%)", running.label, percent));
        }
    }

    fn done(&self, task: &str, message: &str) {
        match self.tasks().remove(task) {
            Some(finished) => finished.bar.finish_with_message(format!("✔ {}", message)),
            None => self.println(format!("✔ {}", message)),
        }
    }

    fn warn(&self, task: &str, message: &str) {
        self.println(format!("! {}: {}", task, message));
    }

    fn fail(&self, task: &str, message: &str) {
        match self.tasks().remove(task) {
            Some(failed) => failed.bar.abandon_with_message(format!("✘ {}", message)),
            None => self.println(format!("✘ {}: {}", task, message)),
        }
    }
}
