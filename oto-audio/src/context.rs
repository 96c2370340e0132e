//! Output clock and render-side voice mixer
//!
//! [`AudioContext`] is the control-side handle: sample rate, frame clock,
//! suspend state and the command queue. [`VoiceRenderer`] is the matching
//! render-side half, driven by the device callback (or a test loop). The two
//! only talk through a bounded command channel, a lock-free completion queue
//! and atomics, so the renderer never waits on the control thread.

use crate::shifter::VoiceSource;
use crate::voice::{CompletionToken, VoiceId};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Pending commands before `send` starts failing
pub const COMMAND_CAPACITY: usize = 4096;
const COMPLETION_CAPACITY: usize = 4096;

/// Bus level where soft clipping starts
const SOFT_CLIP_THRESHOLD: f32 = 0.8;
/// Bus level the soft clipper never exceeds
const SOFT_CLIP_CEILING: f32 = 0.98;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("output device is disconnected")]
    Disconnected,
    #[error("render command queue is full")]
    QueueFull,
}

/// A voice ready to be mixed from an absolute frame
pub struct RenderVoice {
    pub id: VoiceId,
    pub start_frame: u64,
    pub source: Box<dyn VoiceSource>,
    pub token: CompletionToken,
}

/// Control -> render messages
pub enum RenderCommand {
    Start(Box<RenderVoice>),
    Stop(VoiceId),
    StopAll,
}

/// Shared device handle
pub struct AudioContext {
    sample_rate: u32,
    clock: AtomicU64,
    suspended: AtomicBool,
    renderer_alive: AtomicBool,
    commands: Sender<RenderCommand>,
    completions: Mutex<HeapCons<VoiceId>>,
}

impl AudioContext {
    /// Create a running context and its renderer
    pub fn new(sample_rate: u32) -> (Arc<Self>, VoiceRenderer) {
        let (command_tx, command_rx) = bounded(COMMAND_CAPACITY);
        let (completion_tx, completion_rx) = HeapRb::<VoiceId>::new(COMPLETION_CAPACITY).split();

        let context = Arc::new(Self {
            sample_rate: sample_rate.max(1),
            clock: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            renderer_alive: AtomicBool::new(true),
            commands: command_tx,
            completions: Mutex::new(completion_rx),
        });

        let renderer = VoiceRenderer {
            context: Arc::clone(&context),
            commands: command_rx,
            completions: completion_tx,
            voices: Vec::new(),
            mix: Vec::new(),
        };

        (context, renderer)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames rendered so far
    pub fn current_frame(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    /// Context time in seconds
    pub fn current_time(&self) -> f64 {
        self.current_frame() as f64 / self.sample_rate as f64
    }

    /// Nearest frame for a context time in seconds
    pub fn time_to_frame(&self, time: f64) -> u64 {
        (time.max(0.0) * self.sample_rate as f64).round() as u64
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Pause the clock; the renderer outputs silence until resumed
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
    }

    pub fn resume(&self) -> Result<(), DeviceError> {
        if !self.renderer_alive.load(Ordering::Acquire) {
            return Err(DeviceError::Disconnected);
        }
        self.suspended.store(false, Ordering::Release);
        Ok(())
    }

    /// Resume if suspended; fails when the renderer is gone
    pub fn ensure_running(&self) -> Result<(), DeviceError> {
        if !self.renderer_alive.load(Ordering::Acquire) {
            return Err(DeviceError::Disconnected);
        }
        if self.is_suspended() {
            debug!(target: "oto_audio::context", "resuming suspended context");
            self.resume()?;
        }
        Ok(())
    }

    pub(crate) fn send(&self, command: RenderCommand) -> Result<(), DeviceError> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Full(_) => DeviceError::QueueFull,
            TrySendError::Disconnected(_) => DeviceError::Disconnected,
        })
    }

    /// Hand every pending completion to `f`
    pub(crate) fn drain_completions(&self, mut f: impl FnMut(VoiceId)) {
        let mut completions = self.completions.lock();
        while let Some(id) = completions.try_pop() {
            f(id);
        }
    }
}

/// Render-side mixer owned by the output callback
pub struct VoiceRenderer {
    context: Arc<AudioContext>,
    commands: Receiver<RenderCommand>,
    completions: HeapProd<VoiceId>,
    voices: Vec<RenderVoice>,
    mix: Vec<f32>,
}

impl VoiceRenderer {
    pub fn context(&self) -> &Arc<AudioContext> {
        &self.context
    }

    /// Voices queued or playing
    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Fill an interleaved buffer of `channels` channels
    pub fn render(&mut self, output: &mut [f32], channels: usize) {
        self.process_commands();

        let channels = channels.max(1);
        if self.context.is_suspended() {
            output.fill(0.0);
            return;
        }

        let frames = output.len() / channels;
        if self.mix.len() < frames {
            self.mix.resize(frames, 0.0);
        }
        let mix = &mut self.mix[..frames];
        mix.fill(0.0);

        let now = self.context.current_frame();
        let block_end = now + frames as u64;
        let completions = &mut self.completions;

        self.voices.retain_mut(|voice| {
            if voice.start_frame >= block_end {
                return true;
            }
            let offset = voice.start_frame.saturating_sub(now) as usize;
            let wanted = frames - offset;
            let produced = voice.source.render_add(&mut mix[offset..]);
            if produced < wanted {
                voice.token.fire(completions);
                return false;
            }
            true
        });

        for (frame, chunk) in output.chunks_mut(channels).enumerate() {
            let sample = mix.get(frame).copied().map_or(0.0, soft_clip);
            chunk.fill(sample);
        }

        self.context.clock.fetch_add(frames as u64, Ordering::AcqRel);
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                RenderCommand::Start(voice) => self.voices.push(*voice),
                RenderCommand::Stop(id) => self.voices.retain(|v| v.id != id),
                RenderCommand::StopAll => self.voices.clear(),
            }
        }
    }
}

impl Drop for VoiceRenderer {
    fn drop(&mut self) {
        self.context.renderer_alive.store(false, Ordering::Release);
    }
}

/// Soft knee above the threshold, asymptotic to the ceiling
#[inline]
fn soft_clip(x: f32) -> f32 {
    let magnitude = x.abs();
    if magnitude <= SOFT_CLIP_THRESHOLD {
        return x;
    }
    let knee = SOFT_CLIP_CEILING - SOFT_CLIP_THRESHOLD;
    let over = (magnitude - SOFT_CLIP_THRESHOLD) / knee;
    let shaped = SOFT_CLIP_THRESHOLD + knee * (1.0 - (-over * 3.0).exp());
    x.signum() * shaped.min(SOFT_CLIP_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Constant-level source of a fixed length
    struct Constant {
        level: f32,
        remaining: usize,
    }

    impl VoiceSource for Constant {
        fn render_add(&mut self, out: &mut [f32]) -> usize {
            let n = self.remaining.min(out.len());
            for s in &mut out[..n] {
                *s += self.level;
            }
            self.remaining -= n;
            n
        }
    }

    fn start(context: &AudioContext, id: u64, start_frame: u64, len: usize) {
        let voice = RenderVoice {
            id: VoiceId::from_raw(id),
            start_frame,
            source: Box::new(Constant {
                level: 0.25,
                remaining: len,
            }),
            token: CompletionToken::new(VoiceId::from_raw(id)),
        };
        context.send(RenderCommand::Start(Box::new(voice))).unwrap();
    }

    fn completions(context: &AudioContext) -> Vec<VoiceId> {
        let mut done = Vec::new();
        context.drain_completions(|id| done.push(id));
        done
    }

    #[test]
    fn test_voice_starts_on_its_frame() {
        let (context, mut renderer) = AudioContext::new(1000);
        start(&context, 1, 10, 20);

        let mut out = vec![0.0f32; 64];
        renderer.render(&mut out, 2);
        assert_eq!(context.current_frame(), 32);
        assert_eq!(out[2 * 9], 0.0);
        assert_eq!(out[2 * 10], 0.25);
        assert_eq!(out[2 * 10 + 1], 0.25);
        assert_eq!(out[2 * 29], 0.25);
        assert_eq!(out[2 * 30], 0.0);
        assert_eq!(completions(&context), vec![VoiceId::from_raw(1)]);
        assert_eq!(renderer.active_voices(), 0);
    }

    #[test]
    fn test_voice_spanning_blocks_completes_once() {
        let (context, mut renderer) = AudioContext::new(1000);
        start(&context, 3, 0, 100);

        let mut out = vec![0.0f32; 64];
        renderer.render(&mut out, 1);
        assert!(completions(&context).is_empty());
        renderer.render(&mut out, 1);
        assert_eq!(completions(&context), vec![VoiceId::from_raw(3)]);
        renderer.render(&mut out, 1);
        assert!(completions(&context).is_empty());
    }

    #[test]
    fn test_stopped_voices_do_not_complete() {
        let (context, mut renderer) = AudioContext::new(1000);
        start(&context, 1, 0, 100);
        start(&context, 2, 0, 100);

        let mut out = vec![0.0f32; 32];
        renderer.render(&mut out, 1);
        assert!((out[0] - 0.5).abs() < 1e-6);

        context.send(RenderCommand::Stop(VoiceId::from_raw(1))).unwrap();
        renderer.render(&mut out, 1);
        assert!((out[0] - 0.25).abs() < 1e-6);

        context.send(RenderCommand::StopAll).unwrap();
        renderer.render(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(completions(&context).is_empty());
    }

    #[test]
    fn test_suspended_context_holds_clock() {
        let (context, mut renderer) = AudioContext::new(1000);
        start(&context, 1, 0, 10);
        context.suspend();

        let mut out = vec![1.0f32; 16];
        renderer.render(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(context.current_frame(), 0);

        context.ensure_running().unwrap();
        assert!(!context.is_suspended());
        renderer.render(&mut out, 1);
        assert_eq!(context.current_frame(), 16);
    }

    #[test]
    fn test_dropped_renderer_disconnects() {
        let (context, renderer) = AudioContext::new(1000);
        drop(renderer);
        assert_eq!(context.ensure_running(), Err(DeviceError::Disconnected));
        assert_eq!(
            context.send(RenderCommand::StopAll).unwrap_err(),
            DeviceError::Disconnected
        );
    }

    #[test]
    fn test_soft_clip() {
        assert_eq!(soft_clip(0.5), 0.5);
        assert_eq!(soft_clip(-0.8), -0.8);
        assert!(soft_clip(3.0) <= SOFT_CLIP_CEILING);
        assert!(soft_clip(-3.0) >= -SOFT_CLIP_CEILING);
        assert!(soft_clip(0.9) > soft_clip(0.85));
    }

    #[test]
    fn test_time_conversion() {
        let (context, _renderer) = AudioContext::new(48000);
        assert_eq!(context.time_to_frame(0.5), 24000);
        assert_eq!(context.time_to_frame(-1.0), 0);
        assert_eq!(context.current_time(), 0.0);
    }
}
