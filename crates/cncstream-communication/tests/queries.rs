mod common;

use cncstream_communication::{QuerySpec, TinyGAdapter};
use cncstream_core::{ControllerError, ControllerState, Error};
use common::{connect_grbl, connect_with, options, WAIT};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grbl_settings_query() {
    let rig = connect_grbl(options(123)).await;

    let controller = rig.controller.clone();
    let query = tokio::spawn(async move { controller.settings().await });
    assert!(
        rig.peer
            .wait_for(WAIT, |lines| lines.iter().any(|l| l == "$$"))
            .await
    );
    rig.peer.send_line("$0=10");
    rig.peer.send_line("$1=25");
    rig.peer.send_line("$110=500.000");
    rig.peer.send_line("ok");

    let settings = query.await.unwrap().unwrap();
    assert_eq!(settings.len(), 3);
    assert_eq!(settings[0].id, "$0");
    assert_eq!(settings[2].value, "500.000");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_ignores_terminal_before_first_match() {
    let rig = connect_grbl(options(123)).await;
    let spec = QuerySpec::new(
        "$I",
        |line| line.starts_with("[VER:"),
        |line| line == "ok",
    );

    let controller = rig.controller.clone();
    let query = tokio::spawn(async move { controller.query(spec, WAIT).await });
    assert!(rig.peer.wait_for_lines(1, WAIT).await);

    // No match yet, so this ok is not the end of the reply
    rig.peer.send_line("ok");
    rig.peer.send_line("[VER:1.1h.20190825:]");
    rig.peer.send_line("[OPT:V,15,128]");
    rig.peer.send_line("ok");

    let lines = query.await.unwrap().unwrap();
    assert_eq!(lines, vec!["[VER:1.1h.20190825:]".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_rejected_by_firmware() {
    let rig = connect_grbl(options(123)).await;

    let controller = rig.controller.clone();
    let query = tokio::spawn(async move { controller.settings().await });
    assert!(rig.peer.wait_for_lines(1, WAIT).await);
    rig.peer.send_line("error:9");

    let result = query.await.unwrap();
    assert!(matches!(
        result,
        Err(Error::Controller(ControllerError::CommandRejected { .. }))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_times_out_and_frees_slot() {
    let rig = connect_grbl(options(123)).await;
    let spec = QuerySpec::new("$#", |line| line.starts_with("[G54:"), |line| line == "ok");

    let result = rig
        .controller
        .query(spec, Duration::from_millis(150))
        .await;
    assert!(result.unwrap_err().is_timeout());

    let controller = rig.controller.clone();
    let query = tokio::spawn(async move { controller.settings().await });
    assert!(rig.peer.wait_for_lines(2, WAIT).await);
    rig.peer.send_line("$0=10");
    rig.peer.send_line("ok");
    let settings = query.await.unwrap().unwrap();
    assert_eq!(settings.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_waits_for_ready_state() {
    let rig = connect_grbl(options(123)).await;
    rig.peer.send_line("<Run|MPos:0.000,0.000,0.000|FS:100,0>");
    rig.controller
        .wait_for_state(WAIT, |s| s == ControllerState::Run)
        .await
        .unwrap();

    let result = rig.controller.settings().await;
    assert!(result.unwrap_err().is_timeout());
    assert!(rig.peer.written_lines().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tinyg_settings_and_status() {
    let rig = connect_with(
        Arc::new(TinyGAdapter::new()),
        options(254),
        r#"{"r":{"fv":0.970,"fb":440.20},"f":[1,0,6]}"#,
    )
    .await;

    let controller = rig.controller.clone();
    let query = tokio::spawn(async move { controller.settings().await });
    assert!(
        rig.peer
            .wait_for(WAIT, |lines| lines.iter().any(|l| l == r#"{"sys":n}"#))
            .await
    );
    rig.peer
        .send_line(r#"{"r":{"sys":{"fb":440.20,"fv":0.970,"jv":5}},"f":[1,0,10]}"#);

    let settings = query.await.unwrap().unwrap();
    assert_eq!(settings.len(), 3);
    let version = settings.iter().find(|s| s.id == "fv").unwrap();
    assert_eq!(version.value, "0.97");

    rig.peer
        .send_line(r#"{"sr":{"posx":1.5,"posy":2.0,"posz":0.0,"stat":5,"unit":1}}"#);
    rig.controller
        .wait_for_state(WAIT, |s| s == ControllerState::Run)
        .await
        .unwrap();
    let work = rig.controller.status().work_coord().unwrap();
    assert_eq!(work.x, 1.5);
}
