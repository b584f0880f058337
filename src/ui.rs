use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Stage reporting on stderr; stdout stays free for command output.
#[derive(Clone, Debug)]
pub struct Ui {
    pretty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, stderr_is_tty: bool, stdout_is_tty: bool) -> Self {
        let pretty = stderr_is_tty
            && match mode {
                UiMode::Pretty => true,
                // Plain when stdout is piped.
                UiMode::Auto => stdout_is_tty,
                UiMode::Plain => false,
            };
        Self { pretty }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.pretty {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }
}

/// Reports the stage on drop: `✔` once `done()` was called, `✘` otherwise
/// (an early `?` return).
pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    detail: Option<String>,
    succeeded: bool,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            detail: None,
            succeeded: false,
        }
    }

    pub fn done(mut self) {
        self.succeeded = true;
    }

    pub fn done_with(mut self, detail: impl Into<String>) {
        self.detail = Some(detail.into());
        self.succeeded = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.succeeded { "✔" } else { "✘" };
        let detail = self
            .detail
            .as_deref()
            .map(|d| format!(": {}", d))
            .unwrap_or_default();
        let message = format!(
            "{} {}{} ({})",
            mark,
            self.name,
            detail,
            format_duration(self.start.elapsed())
        );
        match &self.spinner {
            Some(spinner) if self.succeeded => spinner.finish_with_message(message),
            Some(spinner) => spinner.abandon_with_message(message),
            None => eprintln!("{message}"),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}
