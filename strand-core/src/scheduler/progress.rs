//! Task Progress Tracking
//!
//! Weight-based progress over reactive cells living in the task's own child
//! container. The root handle carries weight 1.0; forked handles split it,
//! so nested parallel sub-steps contribute proportionally to one overall
//! number without the scheduler knowing the shape of the work.
//!
//! The reported percentage is clamped to never regress, and an exponential
//! moving average of ms-per-unit-weight feeds a remaining-time estimate.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::reactive::{Source, TransformValue, Value, ValuesContainer};

/// Smoothing factor for the ms-per-weight moving average.
const EMA_ALPHA: f64 = 0.2;

struct RateState {
    last_sample_ms: Option<f64>,
    ema_ms_per_weight: Option<f64>,
}

/// Reactive progress state for one task. Clones share state.
#[derive(Clone)]
pub struct ProgressTracker {
    /// Accumulated weight in `[0, 1]`.
    done: Value<f64>,
    percent: TransformValue<f64, f64>,
    infos: Value<Vec<(u64, String)>>,
    info: TransformValue<Vec<(u64, String)>, String>,
    remaining_ms: Value<f64>,
    rate: Arc<Mutex<RateState>>,
    next_info: Arc<Mutex<u64>>,
}

impl ProgressTracker {
    /// Build the progress cells inside the task's container so they are
    /// disposed with it.
    pub fn new(container: &ValuesContainer) -> Self {
        let done = container.value("progress-done", 0.0f64);
        // Monotonic: the estimate may briefly overshoot, the report never
        // walks backwards.
        let percent = container.transformed_self(
            "progress-percent",
            done.as_source(),
            0.0f64,
            |d: f64, prev: f64| prev.max((d * 100.0).min(100.0)),
        );
        let infos = container.value("progress-infos", Vec::<(u64, String)>::new());
        let info = container.transformed(
            "progress-info",
            infos.as_source(),
            |is: Vec<(u64, String)>| {
                is.iter()
                    .map(|(_, label)| label.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            },
        );
        let remaining_ms = container.value("progress-remaining-ms", f64::NAN);
        Self {
            done,
            percent,
            infos,
            info,
            remaining_ms,
            rate: Arc::new(Mutex::new(RateState {
                last_sample_ms: None,
                ema_ms_per_weight: None,
            })),
            next_info: Arc::new(Mutex::new(0)),
        }
    }

    pub fn percent(&self) -> f64 {
        self.percent.get()
    }

    pub fn percent_source(&self) -> crate::reactive::SharedSource<f64> {
        self.percent.as_source()
    }

    pub fn info_source(&self) -> crate::reactive::SharedSource<String> {
        self.info.as_source()
    }

    pub fn remaining_ms_source(&self) -> crate::reactive::SharedSource<f64> {
        self.remaining_ms.as_source()
    }

    /// Overwrite the joined info line with a single label.
    pub fn set_info(&self, label: &str) {
        if label.is_empty() {
            return;
        }
        self.info.set(label.to_string());
    }

    /// Record `weight` units of completed work at timestamp `now_ms`,
    /// updating the moving rate and the remaining-time estimate.
    pub fn advance(&self, weight: f64, now_ms: f64) {
        if weight <= 0.0 {
            return;
        }
        {
            let mut rate = self.rate.lock();
            if let Some(last) = rate.last_sample_ms {
                let sample = (now_ms - last).max(0.0) / weight;
                rate.ema_ms_per_weight = Some(match rate.ema_ms_per_weight {
                    Some(ema) => ema + EMA_ALPHA * (sample - ema),
                    None => sample,
                });
            }
            rate.last_sample_ms = Some(now_ms);
        }
        self.done.mod_value(|d| (d + weight).min(1.0));

        let remaining_weight = (1.0 - self.done.get()).max(0.0);
        if let Some(ema) = self.rate.lock().ema_ms_per_weight {
            self.remaining_ms.set(ema * remaining_weight);
        }
    }

    /// Register a named sub-task; the returned id unregisters it.
    pub fn begin_task(&self, label: &str) -> u64 {
        let id = {
            let mut next = self.next_info.lock();
            let id = *next;
            *next += 1;
            id
        };
        self.infos
            .mod_in_place(|is| is.push((id, label.to_string())));
        id
    }

    pub fn end_task(&self, id: u64) {
        self.infos.mod_in_place(|is| is.retain(|(i, _)| *i != id));
    }
}
