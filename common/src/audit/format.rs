// Human-readable formatting for audit rows

use crate::models::{FileEvent, StepRun, TaskRun};

const BINARY_LABELS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];
const UNIT_STEP: f64 = 1024.0;
// Values that would round up to 1024.0 at one decimal move to the next unit
const UNIT_THRESHOLD: f64 = UNIT_STEP - 0.05;

/// Format a byte count with binary units and one decimal, e.g. `1.5 KiB`
pub fn human_bytes(bytes: f64) -> String {
    let sign = if bytes < 0.0 { "-" } else { "" };
    let mut value = bytes.abs();
    let mut label = BINARY_LABELS[0];

    for (i, unit) in BINARY_LABELS.iter().enumerate() {
        label = unit;
        if value < UNIT_THRESHOLD {
            break;
        }
        if i + 1 < BINARY_LABELS.len() {
            value /= UNIT_STEP;
        }
    }

    format!("{}{:.1} {}", sign, value, label)
}

/// Format a duration in seconds, e.g. `2.35 s`
pub fn human_duration(seconds: f64) -> String {
    format!("{:.2} s", seconds)
}

impl FileEvent {
    pub fn human_size(&self) -> Option<String> {
        self.size.map(|s| human_bytes(s as f64))
    }

    pub fn human_throughput(&self) -> Option<String> {
        self.bytes_per_sec.map(|b| format!("{}/s", human_bytes(b)))
    }

    pub fn human_duration(&self) -> Option<String> {
        self.duration_sec.map(human_duration)
    }
}

impl TaskRun {
    pub fn human_duration(&self) -> Option<String> {
        self.duration_sec.map(human_duration)
    }
}

impl StepRun {
    pub fn human_duration(&self) -> Option<String> {
        self.duration_sec.map(human_duration)
    }
}
