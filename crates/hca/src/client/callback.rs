// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monitor observers and panic-isolated dispatch.
//!
//! Two observer flavors exist, both preserved across reconnects:
//! - **monitors** receive a structured [`MonitorEvent`]
//! - **writers** receive one formatted text line per update, suitable for
//!   appending to a log file
//!
//! A monitor may run inline on the dispatcher thread (stalls the engine
//! for its duration, caller's choice) or on a fresh thread per event.
//! Either way a panicking observer is caught and logged; observers can
//! never take the engine down.

use crate::protocol::PvValue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

/// One value-change notification.
#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub name: String,
    pub value: PvValue,
    /// Textual rendering of `value`.
    pub text: String,
    /// Server timestamp when the update carried one, receive time
    /// otherwise.
    pub timestamp: SystemTime,
}

/// Monitor callback. Shared so registries can be cloned out of the state
/// lock before dispatch.
pub type MonitorFn = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

/// Line-oriented observer.
pub type WriterFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Dispatch options for [`Monitor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorOptions {
    /// Run the callback on a fresh thread per event instead of inline on
    /// the dispatcher.
    pub new_task: bool,
}

/// A registered monitor callback plus its dispatch mode.
#[derive(Clone)]
pub struct Monitor {
    pub callback: MonitorFn,
    pub new_task: bool,
}

impl Monitor {
    pub fn new(callback: MonitorFn, options: MonitorOptions) -> Self {
        Self {
            callback,
            new_task: options.new_task,
        }
    }

    /// Same underlying callback? Used to keep registration idempotent.
    pub fn same_callback(&self, other: &MonitorFn) -> bool {
        Arc::ptr_eq(&self.callback, other)
    }
}

/// Deliver one event to a set of monitors and writers.
pub fn deliver(monitors: &[Monitor], writers: &[WriterFn], event: &MonitorEvent) {
    for monitor in monitors {
        if monitor.new_task {
            let callback = Arc::clone(&monitor.callback);
            let event = event.clone();
            std::thread::spawn(move || run_isolated(&event.name, || callback(&event)));
        } else {
            run_isolated(&event.name, || (monitor.callback)(event));
        }
    }

    if !writers.is_empty() {
        let line = writer_line(event);
        for writer in writers {
            run_isolated(&event.name, || writer(&line));
        }
    }
}

/// `"<name> <unix seconds> <value>\n"`.
fn writer_line(event: &MonitorEvent) -> String {
    let stamp = event
        .timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    format!("{} {:.6} {}\n", event.name, stamp, event.text)
}

fn run_isolated(name: &str, f: impl FnOnce()) {
    let result = catch_unwind(AssertUnwindSafe(f));
    if result.is_err() {
        log::error!("[client] monitor for {} panicked during delivery", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event(value: PvValue) -> MonitorEvent {
        let text = value.to_string();
        MonitorEvent {
            name: "TEST:A.VAL".into(),
            value,
            text,
            timestamp: SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_000),
        }
    }

    #[test]
    fn test_inline_delivery() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let monitor = Monitor::new(
            Arc::new(move |e: &MonitorEvent| {
                assert_eq!(e.value, PvValue::Long(5));
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            MonitorOptions::default(),
        );
        deliver(&[monitor], &[], &event(PvValue::Long(5)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_monitor_is_isolated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let bad = Monitor::new(
            Arc::new(|_: &MonitorEvent| panic!("observer bug")),
            MonitorOptions::default(),
        );
        let good = Monitor::new(
            Arc::new(move |_: &MonitorEvent| {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            MonitorOptions::default(),
        );
        // The panicking monitor must not prevent later deliveries.
        deliver(&[bad, good], &[], &event(PvValue::Long(1)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_writer_line_format() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines2 = Arc::clone(&lines);
        let writer: WriterFn = Arc::new(move |line: &str| {
            lines2.lock().expect("line sink").push(line.to_string());
        });
        deliver(&[], &[writer], &event(PvValue::Double(4.5)));
        let lines = lines.lock().expect("line sink");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("TEST:A.VAL 1000.000000 4.5"));
        assert!(lines[0].ends_with('\n'));
    }

    #[test]
    fn test_same_callback_identity() {
        let callback: MonitorFn = Arc::new(|_: &MonitorEvent| {});
        let monitor = Monitor::new(Arc::clone(&callback), MonitorOptions::default());
        assert!(monitor.same_callback(&callback));
        let other: MonitorFn = Arc::new(|_: &MonitorEvent| {});
        assert!(!monitor.same_callback(&other));
    }
}
