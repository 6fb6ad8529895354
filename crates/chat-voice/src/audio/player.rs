//! Paced playback
//!
//! One frame goes out every [`FRAME_LENGTH`]. Each frame's slot is measured
//! from the start of playback, so a late frame shortens the next wait instead
//! of pushing every later frame back. Playback also ends, without trailing
//! silence, when the sender's connection closes.

use super::{AudioEncoder, AudioSender, AudioSource, FRAME_LENGTH, SAMPLES_PER_FRAME};
use crate::error::{VoiceError, VoiceResult};
use std::sync::Arc;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Called with `true` when frames start flowing and `false` when they stop
pub type SpeakingHook = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
}

/// Handle to a running playback task
///
/// Dropping the handle stops playback at the next frame boundary.
#[derive(Debug)]
pub struct AudioPlayer {
    control: watch::Sender<PlaybackState>,
    task: JoinHandle<VoiceResult<()>>,
}

impl AudioPlayer {
    /// Start streaming `source` through `sender`
    ///
    /// Holding the sender guard is what keeps a second player out.
    pub fn start(
        source: Box<dyn AudioSource>,
        encoder: Option<Box<dyn AudioEncoder>>,
        sender: OwnedMutexGuard<AudioSender>,
        speaking: Option<SpeakingHook>,
    ) -> VoiceResult<Self> {
        if !source.is_encoded() && encoder.is_none() {
            return Err(VoiceError::MissingEncoder);
        }

        let (control, control_rx) = watch::channel(PlaybackState::Playing);
        let task = tokio::spawn(run(source, encoder, sender, control_rx, speaking));
        Ok(Self { control, task })
    }

    pub fn pause(&self) {
        self.control.send_if_modified(|state| {
            if *state == PlaybackState::Playing {
                *state = PlaybackState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.control.send_if_modified(|state| {
            if *state == PlaybackState::Paused {
                *state = PlaybackState::Playing;
                true
            } else {
                false
            }
        });
    }

    pub fn stop(&self) {
        self.control.send_if_modified(|state| {
            if *state == PlaybackState::Stopped {
                false
            } else {
                *state = PlaybackState::Stopped;
                true
            }
        });
    }

    /// Requested state; a finished player reports `Stopped`
    #[must_use]
    pub fn state(&self) -> PlaybackState {
        if self.task.is_finished() {
            PlaybackState::Stopped
        } else {
            *self.control.borrow()
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state() == PlaybackState::Paused
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for playback to end and return its outcome
    pub async fn wait(self) -> VoiceResult<()> {
        self.task
            .await
            .map_err(|err| VoiceError::Playback(err.to_string()))?
    }
}

fn notify(hook: Option<&SpeakingHook>, speaking: bool) {
    if let Some(hook) = hook {
        hook(speaking);
    }
}

async fn run(
    mut source: Box<dyn AudioSource>,
    mut encoder: Option<Box<dyn AudioEncoder>>,
    mut sender: OwnedMutexGuard<AudioSender>,
    mut control: watch::Receiver<PlaybackState>,
    speaking: Option<SpeakingHook>,
) -> VoiceResult<()> {
    notify(speaking.as_ref(), true);

    let result = stream(
        source.as_mut(),
        &mut encoder,
        &mut sender,
        &mut control,
        speaking.as_ref(),
    )
    .await;

    if sender.is_closed() {
        tracing::debug!(ssrc = sender.ssrc(), "Voice connection closed during playback");
    } else if let Err(err) = sender.send_silence().await {
        tracing::debug!(error = %err, "Failed to send trailing silence");
    }
    notify(speaking.as_ref(), false);
    source.cleanup();

    match &result {
        Ok(()) => tracing::debug!(ssrc = sender.ssrc(), "Playback finished"),
        Err(err) => tracing::warn!(ssrc = sender.ssrc(), error = %err, "Playback failed"),
    }
    result
}

async fn stream(
    source: &mut dyn AudioSource,
    encoder: &mut Option<Box<dyn AudioEncoder>>,
    sender: &mut AudioSender,
    control: &mut watch::Receiver<PlaybackState>,
    speaking: Option<&SpeakingHook>,
) -> VoiceResult<()> {
    let mut start = Instant::now();
    let mut loops: u32 = 0;

    loop {
        if sender.is_closed() {
            return Ok(());
        }
        let state = *control.borrow_and_update();
        match state {
            PlaybackState::Stopped => return Ok(()),
            PlaybackState::Paused => {
                sender.send_silence().await?;
                notify(speaking, false);
                tokio::select! {
                    resumed = control.wait_for(|state| *state != PlaybackState::Paused) => {
                        if resumed.is_err() {
                            return Ok(());
                        }
                    }
                    () = sender.closed() => return Ok(()),
                }
                notify(speaking, true);
                start = Instant::now();
                loops = 0;
                continue;
            }
            PlaybackState::Playing => {}
        }

        let Some(frame) = source.read() else {
            return Ok(());
        };
        let encoded = if source.is_encoded() {
            frame
        } else {
            match encoder.as_mut() {
                Some(encoder) => encoder.encode(&frame, SAMPLES_PER_FRAME)?,
                None => return Err(VoiceError::MissingEncoder),
            }
        };

        if let Err(err) = sender.send_frame(&encoded).await {
            return if sender.is_closed() { Ok(()) } else { Err(err) };
        }
        loops = loops.wrapping_add(1);

        tokio::select! {
            () = sleep_until(start + FRAME_LENGTH * loops) => {}
            changed = control.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            () = sender.closed() => return Ok(()),
        }
    }
}
