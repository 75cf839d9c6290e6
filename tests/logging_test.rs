//! Logging Test
//!
//! Captures the records a device emits and checks their targets and the
//! `[device][Component]` prefix.

mod utils;

use log::{Level, LevelFilter, Log, Metadata, Record};
use robocluster::util::logging::{Component, Logger};
use robocluster::MemoryHub;
use std::sync::{Mutex, OnceLock};
use utils::*;

struct CaptureLogger {
    records: Mutex<Vec<(Level, String, String)>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.records.lock().unwrap().push((
            record.level(),
            record.target().to_string(),
            record.args().to_string(),
        ));
    }

    fn flush(&self) {}
}

fn capture() -> &'static CaptureLogger {
    static LOGGER: OnceLock<&'static CaptureLogger> = OnceLock::new();
    LOGGER.get_or_init(|| {
        let logger: &'static CaptureLogger = Box::leak(Box::new(CaptureLogger {
            records: Mutex::new(Vec::new()),
        }));
        log::set_logger(logger).expect("no other logger in this test binary");
        log::set_max_level(LevelFilter::Trace);
        logger
    })
}

fn records_matching(needle: &str) -> Vec<(Level, String, String)> {
    capture()
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, _, message)| message.contains(needle))
        .cloned()
        .collect()
}

#[test]
fn test_component_logger_prefix_and_target() {
    capture();
    Logger::new(Component::Serial, "arm").warn("line noise on /dev/ttyACM0");

    let records = records_matching("line noise");
    assert_eq!(records.len(), 1);
    let (level, target, message) = &records[0];
    assert_eq!(*level, Level::Warn);
    assert_eq!(target, "robocluster::serial");
    assert_eq!(message, "[arm][Serial] line noise on /dev/ttyACM0");
}

#[test]
fn test_device_logs_lifecycle_and_handler_failures() {
    capture();
    let hub = MemoryHub::new();
    let mut device = memory_device(&hub, "logcheck", "rover");
    device
        .on_sync("logcheck/*", |_, _| Err(anyhow::anyhow!("gripper jammed")))
        .unwrap();
    let (handler, seen) = recorder();
    device.on_sync("logcheck/*", handler).unwrap();

    device.start().unwrap();
    device.publish("grip", 1).unwrap();
    expect_event(&seen);
    device.stop().unwrap();

    let started = records_matching("[logcheck][Device] Started in group rover");
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].1, "robocluster::device");

    let failures = records_matching("gripper jammed");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, Level::Warn);
    assert_eq!(failures[0].1, "robocluster::dispatch");
}
