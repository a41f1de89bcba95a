use stage_pipeline::{
    source, source_with_cancel, wait_all, BoxError, CancelReason, CancellationToken, Message,
    Passthrough, PipelineError, Receiver, Stage,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type TransformResult<T> = std::result::Result<Message<T>, BoxError>;

fn square_stage(workers: usize, buffer: usize) -> Stage<i64, i64> {
    Stage::builder("square")
        .workers(workers)
        .output_buffer(buffer)
        .build(|m: Message<i64>| -> TransformResult<i64> { Ok(m.map(|p| p * p)) })
        .expect("Stage build failed")
}

fn double_stage(workers: usize, buffer: usize) -> Stage<i64, i64> {
    Stage::builder("double")
        .workers(workers)
        .output_buffer(buffer)
        .build(|m: Message<i64>| -> TransformResult<i64> { Ok(m.map(|p| p * 2)) })
        .expect("Stage build failed")
}

fn pairs(output: Receiver<Message<i64>>) -> HashSet<(i64, i64)> {
    output.iter().map(|m| (m.id, m.payload)).collect()
}

/// Receive until the stream closes; panics if it stays open past `limit`
fn drain_within(output: &Receiver<Message<i64>>, limit: Duration) -> usize {
    let deadline = Instant::now() + limit;
    let mut count = 0;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match output.recv_timeout(remaining) {
            Ok(_) => count += 1,
            Err(e) if e.is_disconnected() => return count,
            Err(_) => panic!("output stream still open after {limit:?}"),
        }
    }
}

#[test]
fn test_square_then_double() {
    let token = CancellationToken::new();
    let (input, producer) = source(1..=10, 0).expect("Source failed");

    let (out1, h1) = square_stage(3, 4).run(&token, input).expect("Run failed");
    let (out2, h2) = double_stage(2, 4).run(&token, out1).expect("Run failed");

    let got = pairs(out2);
    let expected: HashSet<_> = (1..=10).map(|i| (i, 2 * i * i)).collect();
    assert_eq!(got, expected);

    wait_all([h1, h2]).expect("Pipeline failed");
    assert_eq!(producer.join().expect("Producer panicked"), 10);
}

#[test]
fn test_identity_conserves_messages() {
    for workers in [1, 2, 7] {
        for buffer in [0, 1, 16] {
            let token = CancellationToken::new();
            let (input, _producer) = source(0..200i64, 3).expect("Source failed");
            let stage: Stage<i64, i64> = Stage::builder("identity")
                .workers(workers)
                .output_buffer(buffer)
                .build(Passthrough)
                .expect("Stage build failed");

            let (output, handle) = stage.run(&token, input).expect("Run failed");
            let got = pairs(output);
            let expected: HashSet<_> = (1..=200).map(|id| (id, id - 1)).collect();
            assert_eq!(got, expected, "workers={workers} buffer={buffer}");
            handle.wait().expect("Stage failed");
        }
    }
}

#[test]
fn test_multiple_workers_compare_as_sets() {
    let token = CancellationToken::new();
    let (input, _producer) = source(0..40i64, 0).expect("Source failed");
    let jitter = Stage::builder("jitter")
        .workers(4)
        .output_buffer(8)
        .build(|m: Message<i64>| -> TransformResult<i64> {
            thread::sleep(Duration::from_micros(((m.payload * 37) % 11) as u64 * 100));
            Ok(m)
        })
        .expect("Stage build failed");

    let (output, handle) = jitter.run(&token, input).expect("Run failed");
    let got: Vec<_> = output.iter().map(|m| m.id).collect();
    handle.wait().expect("Stage failed");

    assert_eq!(got.len(), 40);
    let ids: HashSet<_> = got.into_iter().collect();
    assert_eq!(ids, (1..=40).collect::<HashSet<_>>());
}

#[test]
fn test_single_worker_preserves_order() {
    let token = CancellationToken::new();
    let (input, _producer) = source(1..=50i64, 4).expect("Source failed");
    let (output, handle) = square_stage(1, 4).run(&token, input).expect("Run failed");

    let ids: Vec<_> = output.iter().map(|m| m.id).collect();
    handle.wait().expect("Stage failed");
    assert_eq!(ids, (1..=50).collect::<Vec<_>>());
}

#[test]
fn test_transform_can_change_payload_type() {
    let token = CancellationToken::new();
    let (input, _producer) = source(vec![3i64, 4, 5], 0).expect("Source failed");
    let render = Stage::builder("render")
        .workers(2)
        .build(|m: Message<i64>| -> TransformResult<String> {
            Ok(Message::new(m.id, format!("#{}", m.payload)))
        })
        .expect("Stage build failed");

    let (output, handle) = render.run(&token, input).expect("Run failed");
    let got: HashSet<_> = output.iter().map(|m| (m.id, m.payload)).collect();
    handle.wait().expect("Stage failed");

    let expected: HashSet<_> = [(1i64, "#3"), (2, "#4"), (3, "#5")]
        .into_iter()
        .map(|(id, s)| (id, s.to_string()))
        .collect();
    assert_eq!(got, expected);
}

#[test]
fn test_rendezvous_output_applies_backpressure() {
    const WORKERS: usize = 2;
    let token = CancellationToken::new();
    let (input, _producer) = source(0..20i64, 20).expect("Source failed");
    let (output, handle) = square_stage(WORKERS, 0).run(&token, input).expect("Run failed");

    let mut seen = HashSet::new();
    while let Ok(msg) = output.recv() {
        assert!(seen.insert(msg.id), "duplicate message {}", msg.id);
        let consumed = seen.len() as u64;
        let metrics = handle.metrics();
        assert!(metrics.total_emitted() <= consumed);
        assert!(metrics.total_received() <= consumed + WORKERS as u64);
        thread::sleep(Duration::from_millis(5));
    }

    handle.wait().expect("Stage failed");
    assert_eq!(seen, (1..=20).collect::<HashSet<_>>());
}

#[test]
fn test_transform_error_truncates_run() {
    const N: i64 = 20;
    let token = CancellationToken::new();
    let (input, _producer) = source(1..=N, 0).expect("Source failed");
    let picky = Stage::builder("picky")
        .workers(3)
        .output_buffer(2)
        .build(|m: Message<i64>| -> TransformResult<i64> {
            if m.payload == 7 {
                return Err("cannot handle 7".into());
            }
            Ok(m)
        })
        .expect("Stage build failed");

    let (output, handle) = picky.run(&token, input).expect("Run failed");
    let emitted: Vec<_> = output.iter().collect();
    assert!(emitted.len() < N as usize);
    assert!(emitted.iter().all(|m| m.payload != 7));
    assert_eq!(handle.metrics().total_failed(), 1);

    match handle.wait() {
        Err(err @ PipelineError::Transform { .. }) => {
            assert_eq!(err.to_string(), "[picky]: cannot handle 7");
        }
        other => panic!("expected transform error, got {other:?}"),
    }
    // A stage error never cancels the caller's token
    assert!(!token.is_cancelled());
}

#[test]
fn test_upstream_error_leaves_downstream_draining() {
    let token = CancellationToken::new();
    let (input, _producer) = source(1..=30i64, 0).expect("Source failed");
    let failing = Stage::builder("failing")
        .workers(2)
        .output_buffer(4)
        .build(|m: Message<i64>| -> TransformResult<i64> {
            if m.payload == 10 {
                return Err("bad".into());
            }
            Ok(m)
        })
        .expect("Stage build failed");

    let (out1, h1) = failing.run(&token, input).expect("Run failed");
    let (out2, h2) = double_stage(2, 4).run(&token, out1).expect("Run failed");

    let drained = drain_within(&out2, Duration::from_secs(5));
    assert!(drained < 30);
    assert!(matches!(h1.wait(), Err(PipelineError::Transform { .. })));
    h2.wait().expect("Downstream should finish cleanly");
}

#[test]
fn test_shared_token_propagates_failure_across_stages() {
    let token = CancellationToken::new();
    let (input, _producer) = source_with_cancel(1.., 0, &token).expect("Source failed");
    let failing = Stage::builder("failing")
        .workers(2)
        .build(|m: Message<i64>| -> TransformResult<i64> {
            if m.payload == 50 {
                return Err("bad".into());
            }
            Ok(m)
        })
        .expect("Stage build failed");

    let (out1, h1) = failing.run(&token, input).expect("Run failed");
    let (out2, h2) = double_stage(2, 0).run(&token, out1).expect("Run failed");

    let watcher = {
        let token = token.clone();
        thread::spawn(move || {
            let result = h1.wait();
            if result.is_err() {
                token.cancel();
            }
            result
        })
    };

    drain_within(&out2, Duration::from_secs(5));
    let upstream = watcher.join().expect("Watcher panicked");
    assert!(matches!(upstream, Err(PipelineError::Transform { .. })));
    assert!(token.is_cancelled());
    // Downstream either saw the cancellation or had already drained its closed input
    match h2.wait() {
        Ok(()) => {}
        Err(err) => assert!(err.is_cancellation(), "unexpected {err:?}"),
    }
}

#[test]
fn test_cancellation_closes_output() {
    let token = CancellationToken::new();
    // Unbounded producer that only stops once the stage drops its input
    let (input, producer) = source(1.., 0).expect("Source failed");
    let (output, handle) = square_stage(4, 0).run(&token, input).expect("Run failed");

    for _ in 0..5 {
        output.recv().expect("Output closed early");
    }
    token.cancel();

    drain_within(&output, Duration::from_secs(2));
    let deadline = Instant::now() + Duration::from_secs(2);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "workers still running after cancel");
        thread::sleep(Duration::from_millis(1));
    }

    let err = handle.wait().expect_err("Cancelled run should report an error");
    assert!(matches!(
        err,
        PipelineError::Cancelled { reason: CancelReason::Cancelled, .. }
    ));
    assert!(producer.join().expect("Producer panicked") >= 5);
}

#[test]
fn test_cancellation_unblocks_idle_workers() {
    // Input stays open, so workers are parked on the pull
    let (_tx, input) = crossbeam::channel::unbounded::<Message<i64>>();
    let token = CancellationToken::new();
    let (output, handle) = square_stage(3, 1).run(&token, input).expect("Run failed");

    token.cancel();
    assert_eq!(drain_within(&output, Duration::from_secs(2)), 0);
    assert!(handle
        .wait_timeout(Duration::from_secs(2))
        .expect_err("Cancelled run should report an error")
        .is_cancellation());
}

#[test]
fn test_deadline_cancels_stalled_run() {
    let (_tx, input) = crossbeam::channel::unbounded::<Message<i64>>();
    let token = CancellationToken::new().with_timeout(Duration::from_millis(50));
    let (output, handle) = square_stage(2, 0).run(&token, input).expect("Run failed");

    assert_eq!(drain_within(&output, Duration::from_secs(2)), 0);
    match handle.wait() {
        Err(PipelineError::Cancelled { reason, stage }) => {
            assert_eq!(reason, CancelReason::DeadlineExceeded);
            assert_eq!(stage, "square");
        }
        other => panic!("expected deadline error, got {other:?}"),
    }
}

#[test]
fn test_zero_workers_rejected_at_construction() {
    let result: stage_pipeline::Result<Stage<i64, i64>> =
        Stage::builder("idle").workers(0).output_buffer(4).build(Passthrough);
    match result {
        Err(PipelineError::ConfigError(msg)) => assert!(msg.contains("idle")),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn test_stage_can_run_twice() {
    let stage = square_stage(2, 2);
    let token = CancellationToken::new();

    for _ in 0..2 {
        let (input, _producer) = source(1..=5i64, 0).expect("Source failed");
        let (output, handle) = stage.run(&token, input).expect("Run failed");
        let got = pairs(output);
        handle.wait().expect("Stage failed");
        assert_eq!(got, (1..=5).map(|i| (i, i * i)).collect::<HashSet<_>>());
    }
}

#[test]
fn test_cancel_lets_running_transform_finish_without_sending() {
    let (started_tx, started_rx) = crossbeam::channel::bounded::<()>(1);
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);
    let finished = Arc::new(AtomicUsize::new(0));

    let blocking = {
        let finished = Arc::clone(&finished);
        Stage::builder("blocking")
            .workers(1)
            // Room in the buffer, so only the cancellation check can stop the send
            .output_buffer(4)
            .build(move |m: Message<i64>| -> TransformResult<i64> {
                started_tx.send(()).expect("Test dropped the start signal");
                let _ = release_rx.recv();
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(m)
            })
            .expect("Stage build failed")
    };

    // Input stays open so the worker can only stop through cancellation
    let (input_tx, input) = crossbeam::channel::unbounded();
    input_tx.send(Message::new(1, 1)).expect("Send failed");

    let token = CancellationToken::new();
    let (output, handle) = blocking.run(&token, input).expect("Run failed");

    started_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("Transform never started");
    token.cancel();
    release_tx.send(()).expect("Transform stopped waiting");

    assert_eq!(drain_within(&output, Duration::from_secs(2)), 0);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(handle.metrics().total_emitted(), 0);

    let err = handle.wait().expect_err("Cancelled run should report an error");
    assert!(err.is_cancellation(), "unexpected {err:?}");
    drop(input_tx);
}

#[test]
fn test_wait_all_reports_failure_after_waiting_on_every_run() {
    let token = CancellationToken::new();

    let (ok_input, _ok_producer) = source(1..=5i64, 0).expect("Source failed");
    let (ok_output, ok_handle) = square_stage(2, 0).run(&token, ok_input).expect("Run failed");

    let bad = Stage::builder("bad")
        .workers(1)
        .build(|_: Message<i64>| -> TransformResult<i64> { Err("x".into()) })
        .expect("Stage build failed");
    let (bad_input, _bad_producer) = source(1..=5i64, 0).expect("Source failed");
    let (bad_output, bad_handle) = bad.run(&token, bad_input).expect("Run failed");

    assert_eq!(ok_output.iter().count(), 5);
    assert_eq!(bad_output.iter().count(), 0);

    match wait_all([ok_handle, bad_handle]) {
        Err(PipelineError::Transform { stage, source }) => {
            assert_eq!(stage, "bad");
            assert_eq!(source.to_string(), "x");
        }
        other => panic!("expected transform error, got {other:?}"),
    }
}
