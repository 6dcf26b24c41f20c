// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::{Duration, Instant};

use super::*;
use crate::test_support::{FakeSerial, FakeSerialHandle};

fn tuning(backoff_ms: &[u64], queue_capacity: usize) -> SchedulerTuning {
    SchedulerTuning {
        request_timeout: Duration::from_secs(5),
        reply_timeout: Duration::from_secs(5),
        backoff: backoff_ms.iter().map(|&ms| Duration::from_millis(ms)).collect(),
        reopen_interval: Duration::from_millis(10),
        batch_max: 8,
        queue_capacity,
    }
}

fn start(backoff_ms: &[u64], queue_capacity: usize) -> (LinkScheduler, FakeSerialHandle) {
    let (link, handle) = FakeSerial::new();
    let events = Arc::new(EventHub::new());
    (LinkScheduler::start(link, tuning(backoff_ms, queue_capacity), events), handle)
}

fn request(device: DeviceId, priority: Priority, payload: Vec<u8>) -> WireRequest {
    WireRequest { device, priority, payload, reply_len: None, deadline: None, batchable: true }
}

/// Stall the worker inside a retry backoff so the test can fill the queues
/// before anything else dispatches.
async fn stall(scheduler: &LinkScheduler, handle: &FakeSerialHandle) -> RequestHandle {
    handle.fail_transient(1);
    let stall = scheduler
        .submit(WireRequest {
            device: DeviceId::D1,
            priority: Priority::High,
            payload: vec![0xEE],
            reply_len: None,
            deadline: None,
            batchable: false,
        })
        .await
        .unwrap();
    // Give the worker time to pop the request and enter the backoff sleep.
    tokio::time::sleep(Duration::from_millis(20)).await;
    stall
}

#[tokio::test(flavor = "multi_thread")]
async fn emergency_dispatches_before_queued_background() {
    let (scheduler, handle) = start(&[150], 256);
    let stalled = stall(&scheduler, &handle).await;

    let mut background = Vec::new();
    for i in 0..10u8 {
        let req = request(DeviceId::D1, Priority::Background, vec![0xB0, i]);
        background.push(scheduler.submit(req).await.unwrap());
    }
    let emergency = scheduler
        .submit(WireRequest {
            device: DeviceId::D1,
            priority: Priority::Emergency,
            payload: vec![0x5A],
            reply_len: None,
            deadline: None,
            batchable: false,
        })
        .await
        .unwrap();

    stalled.wait().await.unwrap();
    emergency.wait().await.unwrap();
    for req in background {
        req.wait().await.unwrap();
    }

    let frames = handle.frames();
    let emergency_at = frames.iter().position(|f| f == &vec![0x5A]).unwrap();
    let first_background = frames.iter().position(|f| f.starts_with(&[0xB0])).unwrap();
    assert!(
        emergency_at < first_background,
        "emergency frame at {emergency_at}, background at {first_background}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn same_device_commands_coalesce_into_one_frame() {
    let (scheduler, handle) = start(&[150], 256);
    let stalled = stall(&scheduler, &handle).await;

    let mut pending = Vec::new();
    for i in 0..5u8 {
        pending.push(scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![0xC0, i])).await.unwrap());
    }
    stalled.wait().await.unwrap();
    for req in pending {
        req.wait().await.unwrap();
    }

    let frames = handle.frames();
    // One stall frame plus one compound frame holding all five commands.
    let compound = frames.iter().find(|f| f.starts_with(&[0xC0])).unwrap();
    assert_eq!(compound.len(), 10);
    for i in 0..5u8 {
        assert_eq!(&compound[(i as usize) * 2..(i as usize) * 2 + 2], &[0xC0, i]);
    }

    let stats = scheduler.stats();
    assert_eq!(stats.batched_commands, 5);
    assert!(stats.batching_ratio() > 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn batching_never_crosses_devices() {
    let (scheduler, handle) = start(&[150], 256);
    let stalled = stall(&scheduler, &handle).await;

    let a = scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![0xC1, 0])).await.unwrap();
    let b = scheduler.submit(request(DeviceId::D2, Priority::Normal, vec![0xC2, 0])).await.unwrap();

    stalled.wait().await.unwrap();
    a.wait().await.unwrap();
    b.wait().await.unwrap();

    let frames = handle.frames();
    assert!(frames.contains(&vec![0xC1, 0]));
    assert!(frames.contains(&vec![0xC2, 0]));
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_errors_retry_with_backoff() {
    let (scheduler, handle) = start(&[1, 2, 4], 16);
    handle.fail_transient(2);

    let started = Instant::now();
    let req = scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![1])).await.unwrap();
    req.wait().await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(3));
    assert_eq!(scheduler.stats().retries, 2);
    assert_eq!(handle.frame_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_retries_fail_with_transport_failed() {
    let (scheduler, handle) = start(&[1, 2, 4], 16);
    handle.fail_transient(10);

    let req = scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![1])).await.unwrap();
    assert_eq!(req.wait().await, Err(CommandError::TransportFailed));
    assert_eq!(scheduler.stats().retries, 3);
    assert_eq!(scheduler.stats().transport_failures, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_error_quarantines_and_reopens() {
    let (scheduler, handle) = start(&[100], 256);
    let stalled = stall(&scheduler, &handle).await;

    let mut pending = Vec::new();
    for i in 0..20u8 {
        pending.push(scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![0xD0, i])).await.unwrap());
    }
    // Device disappears while the worker is still in its backoff sleep; the
    // retry hits the fatal error. Reopen succeeds on the third attempt.
    handle.fail_fatal(3);

    // The stalled request's retry hits the fatal error.
    assert_eq!(stalled.wait().await, Err(CommandError::TransportDown));
    for req in pending {
        assert_eq!(req.wait().await, Err(CommandError::TransportDown));
    }

    // Fast-fail while quarantined.
    let while_down = scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![9])).await;
    if let Ok(handle) = while_down {
        // Raced the reopen; either outcome is a clean contract.
        let _ = handle.wait().await;
    }

    // Wait out the reopen loop, then traffic flows again.
    let deadline = Instant::now() + Duration::from_secs(2);
    while scheduler.link_down() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!scheduler.link_down(), "link never reopened");
    assert!(handle.reopen_calls() >= 3);

    let req = scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![0xAF])).await.unwrap();
    req.wait().await.unwrap();
    assert!(handle.frames().contains(&vec![0xAF]));
}

#[tokio::test(flavor = "multi_thread")]
async fn try_submit_rejects_when_class_full() {
    let (scheduler, handle) = start(&[200], 1);
    // The in-flight request holds the only Normal permit while it retries.
    handle.fail_transient(1);
    let inflight = scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![1])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let rejected = scheduler.try_submit(request(DeviceId::D1, Priority::Normal, vec![2]));
    assert!(matches!(rejected, Err(CommandError::Busy(_))));

    // Other classes are unaffected.
    let high = scheduler.try_submit(request(DeviceId::D1, Priority::High, vec![3]));
    assert!(high.is_ok());

    inflight.wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_deadline_times_out_without_wire_write() {
    let (scheduler, handle) = start(&[100], 256);
    let stalled = stall(&scheduler, &handle).await;

    let doomed = scheduler
        .submit(WireRequest {
            device: DeviceId::D1,
            priority: Priority::Normal,
            payload: vec![0xDD],
            reply_len: None,
            deadline: Some(Instant::now() + Duration::from_millis(5)),
            batchable: false,
        })
        .await
        .unwrap();

    assert_eq!(doomed.wait().await, Err(CommandError::Timeout));
    stalled.wait().await.unwrap();
    assert!(!handle.frames().contains(&vec![0xDD]));
    assert_eq!(scheduler.stats().timeouts, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn purge_device_cancels_only_that_device() {
    let (scheduler, handle) = start(&[150], 256);
    let stalled = stall(&scheduler, &handle).await;

    let d1 = scheduler.submit(request(DeviceId::D1, Priority::Background, vec![0xA1])).await.unwrap();
    let d2 = scheduler.submit(request(DeviceId::D2, Priority::Background, vec![0xA2])).await.unwrap();

    scheduler.purge_device(DeviceId::D1, Priority::Emergency);

    assert!(matches!(d1.wait().await, Err(CommandError::Busy(_))));
    stalled.wait().await.unwrap();
    d2.wait().await.unwrap();
    assert!(!handle.frames().contains(&vec![0xA1]));
    assert!(handle.frames().contains(&vec![0xA2]));
}

#[tokio::test(flavor = "multi_thread")]
async fn replies_route_to_the_requester() {
    let (scheduler, handle) = start(&[1], 16);
    handle.push_reply(&[0x70, 0x17]);

    let req = scheduler
        .submit(WireRequest {
            device: DeviceId::D1,
            priority: Priority::Normal,
            payload: vec![0xAA, 12, 0x10, 0],
            reply_len: Some(2),
            deadline: None,
            batchable: false,
        })
        .await
        .unwrap();
    assert_eq!(req.wait().await, Ok(vec![0x70, 0x17]));
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_handle_cancels_before_dispatch() {
    let (scheduler, handle) = start(&[150], 256);
    let stalled = stall(&scheduler, &handle).await;

    let req = scheduler.submit(request(DeviceId::D1, Priority::Normal, vec![0xCC])).await.unwrap();
    drop(req);

    stalled.wait().await.unwrap();
    // Settle: the worker skips the cancelled request.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!handle.frames().contains(&vec![0xCC]));
    assert_eq!(scheduler.stats().cancelled, 1);
}
