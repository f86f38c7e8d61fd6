//! Scripted analyzer behind an in-memory bridge.
//!
//! The instrument task gets one end of a `tokio::io::duplex` pipe; the test keeps a
//! [`DeviceHarness`] on the other end to assert on written commands and to send raw
//! reply bytes, in whatever chunking the test wants.

#![allow(dead_code)]

use std::time::Duration;

use rust_vna::bridge::PrologixBridge;
use rust_vna::instrument::{Hp8751a, Hp8751aBuilder, InstrumentEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;

pub const GPIB_ADDRESS: u8 = 17;

/// Guard against hanging tests; longer than any response window used here.
const READ_GUARD: Duration = Duration::from_secs(60);

pub struct DeviceHarness {
    stream: DuplexStream,
    buffer: Vec<u8>,
}

/// Spawn an instrument task over a duplex pipe and consume the bridge set-up.
pub async fn connect(builder: Hp8751aBuilder) -> (Hp8751a, DeviceHarness) {
    let (client, device) = tokio::io::duplex(64 * 1024);
    let vna = builder
        .with_gpib_address(GPIB_ADDRESS)
        .spawn(client)
        .expect("spawn instrument task");
    let mut harness = DeviceHarness {
        stream: device,
        buffer: Vec::new(),
    };
    harness.expect_bridge_init().await;
    (vna, harness)
}

impl DeviceHarness {
    async fn fill(&mut self) {
        let mut chunk = [0u8; 1024];
        let n = tokio::time::timeout(READ_GUARD, self.stream.read(&mut chunk))
            .await
            .expect("timed out waiting for the instrument task to write")
            .expect("read from duplex");
        assert!(n > 0, "instrument task closed the connection");
        self.buffer.extend_from_slice(&chunk[..n]);
    }

    /// Consume the Prologix set-up sequence.
    pub async fn expect_bridge_init(&mut self) {
        let expected = PrologixBridge::new(GPIB_ADDRESS).unwrap().init_bytes();
        while self.buffer.len() < expected.len() {
            self.fill().await;
        }
        let got: Vec<u8> = self.buffer.drain(..expected.len()).collect();
        assert_eq!(
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(&expected)
        );
    }

    /// Next command written to the bus, without address prefix and terminator.
    pub async fn next_command(&mut self) -> String {
        loop {
            if let Some(pos) = self.buffer.windows(2).position(|w| w == b"\r\n") {
                let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
                let text = String::from_utf8(frame[..pos].to_vec()).expect("ASCII command");
                let prefix = format!("++addr {GPIB_ADDRESS}\r");
                return text
                    .strip_prefix(&prefix)
                    .unwrap_or_else(|| panic!("missing address prefix in {text:?}"))
                    .to_string();
            }
            self.fill().await;
        }
    }

    /// Assert the next command text.
    pub async fn expect_command(&mut self, expected: &str) {
        let got = self.next_command().await;
        assert_eq!(got, expected);
    }

    /// Assert the next command starts with `prefix` and return it.
    pub async fn expect_command_starting(&mut self, prefix: &str) -> String {
        let got = self.next_command().await;
        assert!(got.starts_with(prefix), "expected {prefix:?}..., got {got:?}");
        got
    }

    /// Send raw reply bytes.
    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to duplex");
    }

    /// Send a reply split into chunks of `size` bytes.
    pub async fn send_chunked(&mut self, bytes: &[u8], size: usize) {
        for chunk in bytes.chunks(size) {
            self.send(chunk).await;
            tokio::task::yield_now().await;
        }
    }

    /// Whether nothing has been written beyond what was already consumed.
    pub fn nothing_pending(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// `#6NNNNNN` block of big-endian floats followed by the newline.
pub fn float_block(values: &[f32]) -> Vec<u8> {
    let body: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
    let mut bytes = format!("#6{:06}", body.len()).into_bytes();
    bytes.extend_from_slice(&body);
    bytes.push(b'\n');
    bytes
}

/// Trace block: each value followed by a discarded second slot.
pub fn trace_block(values: &[f32]) -> Vec<u8> {
    let pairs: Vec<f32> = values.iter().flat_map(|v| [*v, 0.0]).collect();
    float_block(&pairs)
}

/// Wait for the first event matching `pred`.
pub async fn wait_for<F>(
    events: &mut broadcast::Receiver<InstrumentEvent>,
    mut pred: F,
) -> InstrumentEvent
where
    F: FnMut(&InstrumentEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(READ_GUARD, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}
