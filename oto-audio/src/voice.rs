//! Active voice bookkeeping

use crate::shifter::PitchBackend;
use crate::vibrato::VibratoModulator;
use ringbuf::traits::Producer;
use ringbuf::HeapProd;
use std::fmt;

/// Handle of one scheduled voice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(u64);

impl VoiceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}

/// Natural-end notification carried by a render voice
///
/// Fires at most once. A voice removed by a stop command drops its token
/// without firing.
#[derive(Debug)]
pub struct CompletionToken {
    voice: VoiceId,
    fired: bool,
}

impl CompletionToken {
    pub fn new(voice: VoiceId) -> Self {
        Self { voice, fired: false }
    }

    pub fn voice(&self) -> VoiceId {
        self.voice
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Publish the completion; returns false if it already fired or the queue is full
    pub fn fire(&mut self, completions: &mut HeapProd<VoiceId>) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        completions.try_push(self.voice).is_ok()
    }
}

/// An in-flight voice as seen by the control thread
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveVoice {
    pub id: VoiceId,
    pub backend: PitchBackend,
    /// Absolute context time in seconds
    pub start_time: f64,
    pub end_time: f64,
    pub vibrato: Option<VibratoModulator>,
}

/// Voices of the current session, in scheduling order
#[derive(Debug)]
pub struct VoiceRegistry {
    voices: Vec<ActiveVoice>,
    next_id: u64,
    listening: bool,
}

impl Default for VoiceRegistry {
    fn default() -> Self {
        Self {
            voices: Vec::new(),
            next_id: 1,
            listening: true,
        }
    }
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh voice id (never reused)
    pub fn allocate_id(&mut self) -> VoiceId {
        let id = VoiceId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, voice: ActiveVoice) {
        self.voices.push(voice);
    }

    /// Handle a natural-end notification
    ///
    /// Ignored while listeners are detached and for ids no longer tracked.
    pub fn finish(&mut self, id: VoiceId) -> Option<ActiveVoice> {
        if !self.listening {
            return None;
        }
        let index = self.voices.iter().position(|v| v.id == id)?;
        Some(self.voices.remove(index))
    }

    /// Stop reacting to completions
    pub fn detach_listeners(&mut self) {
        self.listening = false;
    }

    /// React to completions again (new session)
    pub fn attach_listeners(&mut self) {
        self.listening = true;
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn voices(&self) -> &[ActiveVoice] {
        &self.voices
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringbuf::traits::{Consumer, Split};
    use ringbuf::HeapRb;

    fn voice(registry: &mut VoiceRegistry, start: f64) -> VoiceId {
        let id = registry.allocate_id();
        registry.insert(ActiveVoice {
            id,
            backend: PitchBackend::Rate,
            start_time: start,
            end_time: start + 0.5,
            vibrato: None,
        });
        id
    }

    #[test]
    fn test_ids_are_unique() {
        let mut registry = VoiceRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[test]
    fn test_finish_removes_voice() {
        let mut registry = VoiceRegistry::new();
        let a = voice(&mut registry, 0.0);
        let b = voice(&mut registry, 0.5);
        assert_eq!(registry.len(), 2);

        let finished = registry.finish(a).expect("voice a is tracked");
        assert_eq!(finished.start_time, 0.0);
        assert_eq!(registry.voices()[0].id, b);
        assert!(registry.finish(a).is_none());
    }

    #[test]
    fn test_detached_registry_ignores_completions() {
        let mut registry = VoiceRegistry::new();
        let a = voice(&mut registry, 0.0);
        registry.detach_listeners();
        assert!(registry.finish(a).is_none());
        assert_eq!(registry.len(), 1);

        registry.clear();
        registry.attach_listeners();
        assert!(registry.is_empty());
        assert!(registry.is_listening());
    }

    #[test]
    fn test_token_fires_once() {
        let (mut producer, mut consumer) = HeapRb::<VoiceId>::new(4).split();
        let mut token = CompletionToken::new(VoiceId(7));

        assert!(token.fire(&mut producer));
        assert!(token.has_fired());
        assert!(!token.fire(&mut producer));

        assert_eq!(consumer.try_pop(), Some(VoiceId(7)));
        assert_eq!(consumer.try_pop(), None);
    }
}
