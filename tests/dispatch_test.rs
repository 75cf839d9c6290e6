//! Dispatch Test
//!
//! Publish/subscribe between in-memory devices: pattern routing, fan-out,
//! handler isolation, and ordering of the outbound queue.

mod utils;

use anyhow::{anyhow, Result};
use robocluster::{Encoding, MemoryHub};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::timeout;
use utils::*;

#[test]
fn test_nav_heading_reaches_nav_handlers_only() {
    setup_test_logging();
    let hub = MemoryHub::new();
    let mut monitor = memory_device(&hub, "monitor", "rover");
    let mut nav = memory_device(&hub, "nav", "rover");

    let (nav_handler, nav_seen) = recorder();
    let (cam_handler, cam_seen) = recorder();
    monitor.on_sync("nav/*", nav_handler).unwrap();
    monitor.on_sync("cam/*", cam_handler).unwrap();

    monitor.start().unwrap();
    nav.start().unwrap();
    nav.publish("heading", 42).unwrap();

    assert_eq!(expect_event(&nav_seen), ("nav/heading".to_string(), json!(42)));
    expect_silence(&cam_seen);
}

#[test]
fn test_device_hears_its_own_publications() {
    let hub = MemoryHub::new();
    let mut nav = memory_device(&hub, "nav", "rover");
    let (handler, seen) = recorder();
    nav.on_sync("nav/status", handler).unwrap();

    nav.start().unwrap();
    nav.publish("status", json!({"ok": true})).unwrap();
    assert_eq!(expect_event(&seen), ("nav/status".to_string(), json!({"ok": true})));
}

#[test]
fn test_groups_are_isolated() {
    let hub = MemoryHub::new();
    let mut rover = memory_device(&hub, "monitor", "rover");
    let mut lander = memory_device(&hub, "nav", "lander");
    let (handler, seen) = recorder();
    rover.on_sync("*", handler).unwrap();

    rover.start().unwrap();
    lander.start().unwrap();
    lander.publish("heading", 7).unwrap();
    expect_silence(&seen);
}

#[test]
fn test_every_matching_handler_fires_once() {
    let hub = MemoryHub::new();
    let mut monitor = memory_device(&hub, "monitor", "rover");
    let mut arm = memory_device(&hub, "arm", "rover");

    let (handler, seen) = recorder();
    monitor.on_sync("arm/*", handler.clone()).unwrap();
    monitor.on_sync("arm/*", handler.clone()).unwrap();
    monitor.on_sync("*/joint[0-9]", handler.clone()).unwrap();
    monitor.on_sync("arm/grip", handler).unwrap();

    monitor.start().unwrap();
    arm.start().unwrap();
    arm.publish("joint3", 0.5).unwrap();

    for _ in 0..3 {
        assert_eq!(expect_event(&seen).0, "arm/joint3");
    }
    expect_silence(&seen);
}

#[test]
fn test_failing_handlers_do_not_disturb_others() {
    setup_test_logging();
    let hub = MemoryHub::new();
    let mut monitor = memory_device(&hub, "monitor", "rover");
    let mut cam = memory_device(&hub, "cam", "rover");

    monitor
        .on_sync("cam/*", |_, _| Err(anyhow!("frame buffer full")))
        .unwrap();
    monitor
        .on("cam/*", |_, data: Value| async move {
            if data == json!(1) {
                panic!("decoder crashed");
            }
            Ok(())
        })
        .unwrap();
    let (handler, seen) = recorder();
    monitor.on_sync("cam/*", handler).unwrap();

    monitor.start().unwrap();
    cam.start().unwrap();
    cam.publish("frame", 1).unwrap();
    cam.publish("frame", 2).unwrap();

    assert_eq!(expect_event(&seen).1, json!(1));
    assert_eq!(expect_event(&seen).1, json!(2));
    assert!(monitor.is_running());
    monitor.stop().unwrap();
}

#[test]
fn test_handler_registered_while_running() {
    let hub = MemoryHub::new();
    let mut monitor = memory_device(&hub, "monitor", "rover");
    let mut nav = memory_device(&hub, "nav", "rover");
    monitor.start().unwrap();
    nav.start().unwrap();

    let (handler, seen) = recorder();
    monitor.on_sync("nav/*", handler).unwrap();
    // registration is marshaled through the same queue, give it a moment
    std::thread::sleep(Duration::from_millis(100));
    nav.publish("heading", 90).unwrap();
    assert_eq!(expect_event(&seen).1, json!(90));
}

#[test]
fn test_publisher_handle_from_another_thread() {
    let hub = MemoryHub::new();
    let mut monitor = memory_device(&hub, "monitor", "rover");
    let mut nav = memory_device(&hub, "nav", "rover");
    let (handler, seen) = recorder();
    monitor.on_sync("nav/*", handler).unwrap();
    monitor.start().unwrap();
    nav.start().unwrap();

    let publisher = nav.publisher();
    assert_eq!(publisher.name(), "nav");
    std::thread::spawn(move || publisher.publish("odometry", [1.0, 2.0]))
        .join()
        .unwrap()
        .unwrap();
    assert_eq!(expect_event(&seen), ("nav/odometry".to_string(), json!([1.0, 2.0])));
}

#[test]
fn test_publishes_are_sent_in_order() -> Result<()> {
    let taps = peer_runtime();
    let hub = MemoryHub::new();
    let mut tap = hub.tap("rover", Encoding::Json);
    let mut nav = memory_device(&hub, "nav", "rover");
    nav.start()?;

    for i in 0..200 {
        nav.publish("seq", i)?;
    }
    for i in 0..200 {
        let packet = taps.block_on(async { timeout(WAIT, tap.next()).await })??;
        assert_eq!(packet.event(), "nav/seq");
        assert_eq!(packet.data(), &json!(i));
    }
    nav.stop()?;
    Ok(())
}

#[test]
fn test_publications_before_start_are_buffered() -> Result<()> {
    let taps = peer_runtime();
    let hub = MemoryHub::new();
    let mut tap = hub.tap("rover", Encoding::Json);
    let mut nav = memory_device(&hub, "nav", "rover");

    nav.publish("boot", "a")?;
    nav.publish("boot", "b")?;
    nav.start()?;
    assert_eq!(taps.block_on(async { timeout(WAIT, tap.next()).await })??.data(), &json!("a"));
    assert_eq!(taps.block_on(async { timeout(WAIT, tap.next()).await })??.data(), &json!("b"));

    // and across a restart
    nav.stop()?;
    nav.publish("boot", "c")?;
    nav.start()?;
    assert_eq!(taps.block_on(async { timeout(WAIT, tap.next()).await })??.data(), &json!("c"));
    nav.stop()?;
    Ok(())
}
