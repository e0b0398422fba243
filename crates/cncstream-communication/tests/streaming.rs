mod common;

use cncstream_communication::{prepare_job, GrblAdapter};
use cncstream_core::stream::FIELD_DELIMITER;
use cncstream_core::{
    ControllerError, ControllerEvent, ControllerState, Error, GcodeStreamReader, MessageType,
};
use common::{connect_grbl, drain, expect_event, options, settle, WAIT};
use std::io::Write;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_command_waits_for_room() {
    let mut rig = connect_grbl(options(10)).await;

    rig.controller.queue_command("G0X10");
    rig.controller.queue_command("G0Y10");
    rig.controller.start_streaming().unwrap();
    assert_eq!(rig.controller.state(), ControllerState::Run);

    assert!(rig.peer.wait_for_lines(1, WAIT).await);
    settle().await;
    assert_eq!(rig.peer.written_lines(), vec!["G0X10"]);
    assert_eq!(rig.controller.in_flight().len(), 1);

    rig.peer.send_line("ok");
    assert!(rig.peer.wait_for_lines(2, WAIT).await);
    assert_eq!(rig.peer.written_lines(), vec!["G0X10", "G0Y10"]);

    rig.peer.send_line("ok");
    let done = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamComplete { .. })
    })
    .await;
    assert!(matches!(
        done,
        ControllerEvent::StreamComplete {
            sent: 2,
            total: 2,
            success: true
        }
    ));
    assert_eq!(rig.controller.state(), ControllerState::Idle);
    assert!(!rig.controller.is_streaming());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_filling_buffer_exactly_is_sent() {
    // Three 6 byte commands in an 18 byte buffer
    let rig = connect_grbl(options(18)).await;
    for _ in 0..4 {
        rig.controller.queue_command("G1X10");
    }
    rig.controller.start_streaming().unwrap();

    assert!(rig.peer.wait_for_lines(3, WAIT).await);
    settle().await;
    assert_eq!(rig.peer.written_lines().len(), 3);
    assert_eq!(rig.controller.rows_remaining(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_responses_complete_commands_in_send_order() {
    let mut rig = connect_grbl(options(123)).await;
    let queued: Vec<_> = ["G0X1", "G0X2", "G0X3"]
        .iter()
        .map(|text| rig.controller.queue_command(text))
        .collect();
    rig.controller.start_streaming().unwrap();
    assert!(rig.peer.wait_for_lines(3, WAIT).await);

    rig.peer.send_line("ok");
    rig.peer.send_line("error:20");
    rig.peer.send_line("ok");

    let mut completed = Vec::new();
    while completed.len() < 3 {
        if let ControllerEvent::CommandComplete(command) = expect_event(&mut rig.events, |e| {
            matches!(e, ControllerEvent::CommandComplete(_))
        })
        .await
        {
            completed.push(command);
        }
    }

    let sequences: Vec<u64> = completed.iter().map(|c| c.sequence()).collect();
    let expected: Vec<u64> = queued.iter().map(|c| c.sequence()).collect();
    assert_eq!(sequences, expected);
    assert!(completed[0].is_ok());
    assert!(completed[1].is_error());
    assert!(completed[2].is_ok());

    let done = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamComplete { .. })
    })
    .await;
    assert!(matches!(
        done,
        ControllerEvent::StreamComplete {
            sent: 3,
            success: false,
            ..
        }
    ));
    // Every row was already in flight, so nothing was left to hold back
    assert!(!rig.peer.wrote_bytes(b"!"));
    assert_eq!(rig.controller.state(), ControllerState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_pauses_until_resumed() {
    let mut opts = options(123);
    opts.single_step = true;
    let mut rig = connect_grbl(opts).await;

    rig.controller.queue_command("G0X1");
    rig.controller.queue_command("G5");
    rig.controller.queue_command("G0X3");
    rig.controller.start_streaming().unwrap();

    assert!(rig.peer.wait_for_lines(1, WAIT).await);
    rig.peer.send_line("ok");
    assert!(rig.peer.wait_for_lines(2, WAIT).await);
    rig.peer.send_line("error:20");

    let paused = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::PausedOnError(_))
    })
    .await;
    if let ControllerEvent::PausedOnError(command) = paused {
        assert_eq!(command.command(), "G5");
    }
    rig.controller
        .wait_for_state(WAIT, |s| s == ControllerState::Hold)
        .await
        .unwrap();
    settle().await;
    assert!(rig.controller.is_paused());
    assert!(rig.peer.wrote_bytes(b"!"));
    assert_eq!(rig.peer.written_lines().len(), 2);

    rig.controller.resume_stream().unwrap();
    assert!(rig.peer.wrote_bytes(b"~"));
    assert_eq!(rig.controller.state(), ControllerState::Run);
    assert!(rig.peer.wait_for_lines(3, WAIT).await);
    rig.peer.send_line("ok");

    let done = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamComplete { .. })
    })
    .await;
    assert!(matches!(
        done,
        ControllerEvent::StreamComplete {
            sent: 3,
            total: 3,
            success: false
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oversize_command_is_rejected_without_writing() {
    let mut rig = connect_grbl(options(10)).await;
    rig.controller.queue_command("G1X100Y100Z100");
    rig.controller.queue_command("G0X1");
    rig.controller.start_streaming().unwrap();

    let paused = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::PausedOnError(_))
    })
    .await;
    if let ControllerEvent::PausedOnError(command) = paused {
        assert!(command.is_error());
    }
    settle().await;
    assert!(rig.peer.written_lines().is_empty());
    assert_eq!(rig.controller.state(), ControllerState::Hold);
    assert!(rig.peer.wrote_bytes(b"!"));

    rig.controller.resume_stream().unwrap();
    assert!(rig.peer.wait_for_lines(1, WAIT).await);
    assert_eq!(rig.peer.written_lines(), vec!["G0X1"]);
    rig.peer.send_line("ok");

    let done = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamComplete { .. })
    })
    .await;
    assert!(matches!(
        done,
        ControllerEvent::StreamComplete {
            sent: 1,
            total: 2,
            success: false
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_waits_for_in_flight_then_resets() {
    let mut rig = connect_grbl(options(18)).await;
    for _ in 0..503 {
        rig.controller.queue_command("G1X10");
    }
    rig.controller.start_streaming().unwrap();
    assert!(rig.peer.wait_for_lines(3, WAIT).await);
    settle().await;
    assert_eq!(rig.controller.in_flight().len(), 3);
    assert_eq!(rig.controller.rows_remaining(), 500);

    let controller = rig.controller.clone();
    let cancel = tokio::spawn(async move { controller.cancel_stream().await });

    let peer = rig.peer.clone();
    assert!(rig.peer.wait_for(WAIT, |_| peer.wrote_bytes(b"!")).await);
    assert!(rig.controller.is_streaming());
    assert_eq!(rig.controller.rows_remaining(), 0);
    expect_event(&mut rig.events, |e| {
        matches!(
            e,
            ControllerEvent::ConsoleMessage(MessageType::Info, text)
                if text.contains("500 unsent rows dropped")
        )
    })
    .await;

    for _ in 0..3 {
        rig.peer.send_line("ok");
    }
    cancel.await.unwrap().unwrap();

    let canceled = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamCanceled { .. })
    })
    .await;
    assert!(matches!(
        canceled,
        ControllerEvent::StreamCanceled {
            sent: 3,
            total: 503
        }
    ));
    assert_eq!(rig.controller.state(), ControllerState::Idle);
    assert!(rig.peer.wrote_bytes(&[0x18]));
    assert_eq!(rig.peer.written_lines().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_forces_reset_when_firmware_is_silent() {
    let mut opts = options(18);
    opts.cancel_timeout = Duration::from_millis(200);
    let mut rig = connect_grbl(opts).await;
    for _ in 0..5 {
        rig.controller.queue_command("G1X10");
    }
    rig.controller.start_streaming().unwrap();
    assert!(rig.peer.wait_for_lines(3, WAIT).await);

    rig.controller.cancel_stream().await.unwrap();

    let canceled = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamCanceled { .. })
    })
    .await;
    assert!(matches!(
        canceled,
        ControllerEvent::StreamCanceled { sent: 3, total: 5 }
    ));
    assert!(rig.controller.in_flight().is_empty());
    assert!(rig.peer.wrote_bytes(&[0x18]));
    assert_eq!(rig.controller.state(), ControllerState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_file_skips_comment_rows() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("job.nc");
    let dest = dir.path().join("job.stream");
    let mut file = std::fs::File::create(&source).unwrap();
    writeln!(file, "G21").unwrap();
    writeln!(file, "(facing pass)").unwrap();
    writeln!(file, "G0 X1 ; rapid").unwrap();
    drop(file);

    let rows = prepare_job(&source, &dest, &GrblAdapter::new(), 20).unwrap();
    assert_eq!(rows, 3);

    let mut rig = connect_grbl(options(123)).await;
    let reader = GcodeStreamReader::open(&dest).unwrap();
    assert_eq!(rig.controller.queue_stream(reader), 3);
    rig.controller.start_streaming().unwrap();

    assert!(rig.peer.wait_for_lines(2, WAIT).await);
    assert_eq!(rig.peer.written_lines(), vec!["G21", "G0X1"]);
    rig.peer.send_line("ok");
    rig.peer.send_line("ok");

    let done = expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamComplete { .. })
    })
    .await;
    assert!(matches!(
        done,
        ControllerEvent::StreamComplete {
            sent: 2,
            total: 3,
            success: true
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_streaming_guards() {
    let mut rig = connect_grbl(options(123)).await;
    assert!(matches!(
        rig.controller.start_streaming(),
        Err(Error::Controller(ControllerError::NothingToStream))
    ));

    rig.controller.queue_command("G0X1");
    rig.controller.start_streaming().unwrap();
    assert!(matches!(
        rig.controller.start_streaming(),
        Err(Error::Controller(ControllerError::AlreadyStreaming))
    ));
    assert!(matches!(
        rig.controller.send_command("G0X2"),
        Err(Error::Controller(ControllerError::InvalidState { .. }))
    ));

    assert!(rig.peer.wait_for_lines(1, WAIT).await);
    rig.peer.send_line("ok");
    expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::StreamComplete { .. })
    })
    .await;
    let seen = drain(&mut rig.events);
    assert!(!seen
        .iter()
        .any(|e| matches!(e, ControllerEvent::StreamCanceled { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_stream_file_cancels_job_only() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("damaged.stream");
    {
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{:<20}", 2).unwrap();
        writeln!(file, "G0X1{d}G0 X1{d}{d}1", d = FIELD_DELIMITER).unwrap();
        file.write_all(b"G0X\xff\xfe").unwrap();
        writeln!(file, "{d}G0 X2{d}{d}2", d = FIELD_DELIMITER).unwrap();
    }

    let mut rig = connect_grbl(options(123)).await;
    rig.controller
        .queue_stream(GcodeStreamReader::open(&path).unwrap());
    rig.controller.start_streaming().unwrap();

    expect_event(&mut rig.events, |e| {
        matches!(
            e,
            ControllerEvent::ConsoleMessage(MessageType::Error, text)
                if text.starts_with("Stream file unreadable")
        )
    })
    .await;
    let peer = rig.peer.clone();
    assert!(rig.peer.wait_for(WAIT, |_| peer.wrote_bytes(b"!")).await);
    assert_eq!(rig.peer.written_lines(), vec!["G0X1"]);

    rig.peer.send_line("ok");
    let canceled = expect_event(&mut rig.events, |e| {
        matches!(
            e,
            ControllerEvent::StreamCanceled { .. } | ControllerEvent::Disconnected { .. }
        )
    })
    .await;
    assert!(matches!(
        canceled,
        ControllerEvent::StreamCanceled { sent: 1, total: 2 }
    ));
    assert!(rig.controller.is_connected());
    assert_eq!(rig.controller.state(), ControllerState::Idle);

    let command = rig.controller.execute("G0X5", Duration::from_millis(500));
    let peer = rig.peer.clone();
    let reply = tokio::spawn(async move {
        assert!(peer.wait_for(WAIT, |lines| lines.iter().any(|l| l == "G0X5")).await);
        peer.send_line("ok");
    });
    assert!(command.await.unwrap().is_ok());
    reply.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_post_cancel_write_drops_session() {
    let mut rig = connect_grbl(options(18)).await;
    for _ in 0..5 {
        rig.controller.queue_command("G1X10");
    }
    rig.controller.start_streaming().unwrap();
    assert!(rig.peer.wait_for_lines(3, WAIT).await);

    let controller = rig.controller.clone();
    let cancel = tokio::spawn(async move { controller.cancel_stream().await });
    let peer = rig.peer.clone();
    assert!(rig.peer.wait_for(WAIT, |_| peer.wrote_bytes(b"!")).await);

    rig.peer.refuse_writes();
    for _ in 0..3 {
        rig.peer.send_line("ok");
    }
    cancel.await.unwrap().unwrap();

    expect_event(&mut rig.events, |e| {
        matches!(e, ControllerEvent::Disconnected { .. })
    })
    .await;
    assert!(!rig.peer.wrote_bytes(&[0x18]));
    assert!(!rig.controller.is_connected());
    assert_eq!(rig.controller.state(), ControllerState::Disconnected);
}
