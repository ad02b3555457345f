//! Screen control and the capture pipeline.
//!
//! Every side effect on the controlled machine goes through the
//! [`ScreenController`] trait: one implementation shells out to the
//! configured capture command and `xdotool`, tests substitute a scripted
//! one. The [`CapturePipeline`] drives continuous capture at a target
//! frame rate into a single-slot gate, so a slow uplink sees only the
//! newest frame and a one-shot capture never waits behind the stream.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command as ProcessCommand;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use periscope_proto::{Frame, ScrollDirection};

/// Failure in the screen control layer.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("capture is not configured (set capture_command)")]
    CaptureNotConfigured,
    #[error("tts is not configured (set tts_command)")]
    TtsNotConfigured,
    #[error("command {0:?} exited with {1}")]
    CommandFailed(String, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The seam between command execution and the machine's screen.
#[async_trait]
pub trait ScreenController: Send + Sync {
    /// Capture the screen as an encoded image.
    async fn capture(&self) -> Result<Vec<u8>, ControllerError>;

    /// Type text into the focused window.
    async fn inject_text(&self, text: &str) -> Result<(), ControllerError>;

    /// Press a key combination, e.g. `alt+enter`.
    async fn key_combo(&self, combo: &str) -> Result<(), ControllerError>;

    /// Scroll the focused window.
    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), ControllerError>;

    /// Speak text aloud.
    async fn speak(&self, text: &str) -> Result<(), ControllerError>;
}

/// Controller backed by external tools: the configured capture and tts
/// command templates, `xdotool` for input injection.
pub struct ExecController {
    capture_command: Option<String>,
    tts_command: Option<String>,
}

impl ExecController {
    pub fn new(capture_command: Option<String>, tts_command: Option<String>) -> Self {
        Self {
            capture_command,
            tts_command,
        }
    }

    async fn run_shell(&self, command: &str) -> Result<(), ControllerError> {
        let status = ProcessCommand::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(ControllerError::CommandFailed(
                command.to_string(),
                status.to_string(),
            ));
        }
        Ok(())
    }

    async fn xdotool(&self, args: &[&str]) -> Result<(), ControllerError> {
        let status = ProcessCommand::new("xdotool")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(ControllerError::CommandFailed(
                format!("xdotool {}", args.join(" ")),
                status.to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ScreenController for ExecController {
    async fn capture(&self) -> Result<Vec<u8>, ControllerError> {
        let template = self
            .capture_command
            .as_deref()
            .ok_or(ControllerError::CaptureNotConfigured)?;
        let out = tempfile::Builder::new().suffix(".png").tempfile()?;
        let path = out.path().to_string_lossy().into_owned();
        self.run_shell(&template.replace("{out}", &path)).await?;
        Ok(tokio::fs::read(out.path()).await?)
    }

    async fn inject_text(&self, text: &str) -> Result<(), ControllerError> {
        self.xdotool(&["type", "--delay", "12", "--", text]).await
    }

    async fn key_combo(&self, combo: &str) -> Result<(), ControllerError> {
        self.xdotool(&["key", combo]).await
    }

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), ControllerError> {
        // Buttons 4/5 are the wheel; one click per unit of `amount`.
        let button = match direction {
            ScrollDirection::Up => "4",
            ScrollDirection::Down => "5",
        };
        self.xdotool(&["click", "--repeat", &amount.to_string(), button])
            .await
    }

    async fn speak(&self, text: &str) -> Result<(), ControllerError> {
        let template = self
            .tts_command
            .as_deref()
            .ok_or(ControllerError::TtsNotConfigured)?;
        // Shell-quote by single-quoting; embedded quotes are escaped.
        let quoted = format!("'{}'", text.replace('\'', r"'\''"));
        self.run_shell(&template.replace("{text}", &quoted)).await
    }
}

/// Counters reported to the remote as `stream_stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
}

struct PipelineState {
    task: Option<JoinHandle<()>>,
    fps: u32,
}

/// Continuous screen capture with latest-frame-wins delivery.
pub struct CapturePipeline {
    controller: Arc<dyn ScreenController>,
    slot: Mutex<Option<Frame>>,
    notify: Notify,
    next_seq: AtomicU64,
    captured: AtomicU64,
    dropped: AtomicU64,
    state: Mutex<PipelineState>,
}

impl CapturePipeline {
    pub fn new(controller: Arc<dyn ScreenController>) -> Arc<Self> {
        Arc::new(Self {
            controller,
            slot: Mutex::new(None),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            captured: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            state: Mutex::new(PipelineState { task: None, fps: 0 }),
        })
    }

    /// Capture one frame immediately, bypassing the stream slot.
    pub async fn one_shot(&self) -> Result<Frame, ControllerError> {
        let data = self.controller.capture().await?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        Ok(Frame::new(seq, data))
    }

    /// Start (or retune) the stream at `fps`. Restarting replaces the
    /// previous capture task.
    pub fn start(self: &Arc<Self>, fps: u32) {
        let mut state = self.state.lock().expect("pipeline lock");
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.fps = fps;
        let pipeline = Arc::clone(self);
        state.task = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(1000 / u64::from(fps.max(1))));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                match pipeline.controller.capture().await {
                    Ok(data) => {
                        let seq = pipeline.next_seq.fetch_add(1, Ordering::Relaxed);
                        pipeline.offer(Frame::new(seq, data));
                    }
                    Err(err) => {
                        warn!(%err, "stream capture failed");
                    }
                }
            }
        }));
        debug!(fps, "stream started");
    }

    /// Stop the stream. Returns `false` if none was running.
    pub fn stop(&self) -> bool {
        let mut state = self.state.lock().expect("pipeline lock");
        match state.task.take() {
            Some(task) => {
                task.abort();
                state.fps = 0;
                true
            }
            None => false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().expect("pipeline lock").task.is_some()
    }

    fn offer(&self, frame: Frame) {
        self.captured.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.slot.lock().expect("pipeline lock");
        if slot.replace(frame).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        drop(slot);
        self.notify.notify_one();
    }

    /// Wait for the next stream frame. Frames overwritten before this
    /// returns are dropped and counted.
    pub async fn next_frame(&self) -> Frame {
        loop {
            if let Some(frame) = self.slot.lock().expect("pipeline lock").take() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_captured: self.captured.load(Ordering::Relaxed),
            frames_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        if let Some(task) = self.state.lock().expect("pipeline lock").task.take() {
            task.abort();
        }
    }
}
