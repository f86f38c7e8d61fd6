//! Response deadlines, queue recovery and link loss.

mod common;

use std::time::Duration;

use common::{connect, wait_for};
use rust_vna::bridge::ConnectionState;
use rust_vna::instrument::{Hp8751aBuilder, InstrumentEvent};
use rust_vna::protocol::command::CommandKind;
use rust_vna::sweep::{SweepMode, SweepState};
use rust_vna::VnaError;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out_and_next_is_sent() {
    let (vna, mut device) = connect(Hp8751aBuilder::new()).await;
    let mut events = vna.subscribe();
    let started = Instant::now();

    let first = tokio::spawn({
        let vna = vna.clone();
        async move { vna.identify().await }
    });
    device.expect_command("*IDN?").await;

    let second = tokio::spawn({
        let vna = vna.clone();
        async move { vna.identify().await }
    });

    // Only after the first window expires does the second command go out
    device.expect_command("*IDN?").await;
    assert!(started.elapsed() >= Duration::from_secs(5));
    device.send(b"HP8751A\n").await;

    let err = first.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        VnaError::Timeout {
            kind: CommandKind::Identify,
            ..
        }
    ));
    assert_eq!(second.await.unwrap().unwrap(), "HP8751A");

    let event = wait_for(&mut events, |e| matches!(e, InstrumentEvent::Timeout { .. })).await;
    assert!(matches!(
        event,
        InstrumentEvent::Timeout {
            kind: CommandKind::Identify,
            ..
        }
    ));
    vna.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_partial_reply_is_dropped_with_the_timed_out_command() {
    let (vna, mut device) = connect(
        Hp8751aBuilder::new().with_response_timeout(Duration::from_secs(1)),
    )
    .await;

    let first = tokio::spawn({
        let vna = vna.clone();
        async move { vna.identify().await }
    });
    device.expect_command("*IDN?").await;
    device.send(b"HP87").await;
    assert!(first.await.unwrap().is_err());

    let second = tokio::spawn({
        let vna = vna.clone();
        async move { vna.identify().await }
    });
    device.expect_command("*IDN?").await;
    device.send(b"HP8751A\n").await;
    assert_eq!(second.await.unwrap().unwrap(), "HP8751A");
    vna.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sweep_step_timeout_aborts_to_idle() {
    let (vna, mut device) = connect(Hp8751aBuilder::new()).await;
    let mut events = vna.subscribe();

    vna.start_sweep(SweepMode::Single).await.unwrap();
    device.expect_command_starting("STAR ").await;
    device.send(b"1\n").await;
    device.expect_command_starting("CHAN1;AVEROFF").await;
    device.send(b"1\n").await;
    device.expect_command("HOLD?").await;

    let event = wait_for(&mut events, |e| matches!(e, InstrumentEvent::SweepAborted { .. })).await;
    let InstrumentEvent::SweepAborted { state, error } = event else {
        unreachable!()
    };
    assert_eq!(state, SweepState::PollHold);
    assert!(matches!(
        error,
        VnaError::Timeout {
            kind: CommandKind::PollHold,
            ..
        }
    ));
    assert_eq!(vna.state(), SweepState::Idle);

    // A fresh sweep can start right away
    vna.start_sweep(SweepMode::Single).await.unwrap();
    device.expect_command_starting("STAR ").await;
    vna.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn framing_error_drops_command_and_reports_it() {
    let (vna, mut device) = connect(Hp8751aBuilder::new()).await;
    let mut events = vna.subscribe();

    let measure = tokio::spawn({
        let vna = vna.clone();
        async move { vna.measure().await }
    });
    device.expect_command_starting("STAR ").await;
    device.send(b"1\n").await;
    device.expect_command_starting("CHAN1;AVEROFF").await;
    device.send(b"1\n").await;
    device.expect_command("HOLD?").await;
    device.send(b"1\n").await;
    device.expect_command_starting("CHAN1;AUTO").await;
    device.send(b"1.0E+01;-2.0E+01;4.5E+01;0.0E+00;1\n").await;
    device.expect_command("OUTPSTIM?").await;
    device.send(b"garbage\n").await;

    let err = measure.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        VnaError::Framing {
            kind: CommandKind::GetStimulus,
            ..
        }
    ));
    wait_for(&mut events, |e| matches!(e, InstrumentEvent::FramingError { .. })).await;
    assert_eq!(vna.state(), SweepState::Idle);
    vna.shutdown().await;
}

#[tokio::test]
async fn closed_bridge_fails_pending_and_later_commands() {
    let (vna, mut device) = connect(Hp8751aBuilder::new()).await;
    let mut connection = vna.connection_watch();

    let pending = tokio::spawn({
        let vna = vna.clone();
        async move { vna.identify().await }
    });
    device.expect_command("*IDN?").await;
    drop(device);

    assert!(matches!(
        pending.await.unwrap().unwrap_err(),
        VnaError::NotConnected
    ));
    connection
        .wait_for(|state| *state == ConnectionState::Unconnected)
        .await
        .unwrap();

    assert!(matches!(
        vna.identify().await.unwrap_err(),
        VnaError::NotConnected
    ));
    assert!(matches!(
        vna.start_sweep(SweepMode::Single).await.unwrap_err(),
        VnaError::NotConnected
    ));
    vna.shutdown().await;
}

#[tokio::test]
async fn shutdown_fails_outstanding_commands() {
    let (vna, mut device) = connect(Hp8751aBuilder::new()).await;

    let pending = tokio::spawn({
        let vna = vna.clone();
        async move { vna.identify().await }
    });
    device.expect_command("*IDN?").await;
    vna.shutdown().await;

    assert!(matches!(
        pending.await.unwrap().unwrap_err(),
        VnaError::ActorGone
    ));
    assert!(matches!(
        vna.identify().await.unwrap_err(),
        VnaError::ActorGone
    ));
}
