//! Playback position tracking.
//!
//! Receivers never say "you have been paused for N seconds", and they do not
//! reliably emit a terminal event when an app crashes, is replaced, or is
//! stopped by hand. The tracker derives those lifecycle events from the
//! status stream instead:
//!
//! | Input                                   | Effect                           |
//! |-----------------------------------------|----------------------------------|
//! | first `MEDIA_STATUS`                    | bind to its media session        |
//! | `PLAYING`                               | start the clock at the offset    |
//! | `BUFFERING` / `PAUSED` / same-id `IDLE` | freeze the offset, report pause  |
//! | `IDLE` with another media session id    | close                            |
//! | `CLOSE`, or app missing from receiver   | close                            |
//!
//! Close reports the last computed offset exactly once, then disconnects.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::time::Instant;

use crate::merge::merge;
use crate::protocol::{MediaStatusEntry, PlayerState, ReceiverMessage};
use crate::transport::MessageStream;

/// The media a host is playing.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedMedia {
    pub content_id: String,
    /// Receiver media session, once bound.
    pub media_session_id: Option<i64>,
}

impl TrackedMedia {
    pub fn new(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            media_session_id: None,
        }
    }
}

/// Session internals the tracker needs from its hosting app.
#[async_trait]
pub trait TrackerHost: Send + Sync {
    fn current_media(&self) -> Option<TrackedMedia>;

    fn set_current_media(&self, media: Option<TrackedMedia>);

    /// Called with the computed offset, in seconds, whenever playback stops.
    async fn on_player_paused(&self, media: &TrackedMedia, offset: f64);

    async fn on_player_resumed(&self, _media: &TrackedMedia, _offset: f64) {}

    /// Tears down the device connection.
    async fn disconnect(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle events derived from the status stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackerEvent {
    Paused { offset: f64 },
    Resumed { offset: f64 },
    Closed { offset: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Unattached,
    Playing { started: Instant, base_offset: f64 },
    Paused { offset: f64 },
    Closed,
}

/// Pure tracking state for one hosted app.
#[derive(Debug, Clone)]
pub struct TrackerState {
    app_id: String,
    media_session_id: Option<i64>,
    phase: Phase,
    last_offset: f64,
}

impl TrackerState {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            media_session_id: None,
            phase: Phase::Unattached,
            last_offset: 0.0,
        }
    }

    /// Media session this state is bound to.
    pub fn media_session_id(&self) -> Option<i64> {
        self.media_session_id
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.phase, Phase::Playing { .. })
    }

    /// Offset in seconds as of `now`.
    pub fn offset_at(&self, now: Instant) -> f64 {
        match self.phase {
            Phase::Playing {
                started,
                base_offset,
            } => base_offset + now.saturating_duration_since(started).as_secs_f64(),
            Phase::Paused { offset } => offset,
            Phase::Unattached | Phase::Closed => self.last_offset,
        }
    }

    /// Applies one message received at `now`.
    pub fn handle(&mut self, message: &ReceiverMessage, now: Instant) -> Vec<TrackerEvent> {
        if self.is_closed() {
            return Vec::new();
        }

        match message {
            ReceiverMessage::MediaStatus { status } => status
                .iter()
                .filter_map(|entry| self.handle_status(entry, now))
                .collect(),
            ReceiverMessage::ReceiverStatus(body) => {
                if body.clone().into_status().is_running(&self.app_id) {
                    Vec::new()
                } else {
                    log::info!("[Tracker] {} no longer running", self.app_id);
                    vec![self.close(now)]
                }
            }
            ReceiverMessage::Close => vec![self.close(now)],
            ReceiverMessage::LoadFailed { .. } | ReceiverMessage::Unknown => Vec::new(),
        }
    }

    fn handle_status(&mut self, entry: &MediaStatusEntry, now: Instant) -> Option<TrackerEvent> {
        if self.is_closed() {
            return None;
        }

        let bound = *self.media_session_id.get_or_insert(entry.media_session_id);
        if entry.media_session_id != bound {
            if entry.player_state == PlayerState::Idle {
                log::info!(
                    "[Tracker] Media session {} replaced by {}",
                    bound,
                    entry.media_session_id
                );
                return Some(self.close(now));
            }
            return None;
        }

        match entry.player_state {
            PlayerState::Playing => {
                let resumed = !self.is_playing();
                self.phase = Phase::Playing {
                    started: now,
                    base_offset: entry.current_time,
                };
                self.last_offset = entry.current_time;
                resumed.then_some(TrackerEvent::Resumed {
                    offset: entry.current_time,
                })
            }
            PlayerState::Buffering | PlayerState::Paused | PlayerState::Idle => {
                let offset = match self.phase {
                    Phase::Playing { .. } | Phase::Paused { .. } => self.offset_at(now),
                    _ => entry.current_time,
                };
                let already_paused = matches!(self.phase, Phase::Paused { .. });
                self.phase = Phase::Paused { offset };
                self.last_offset = offset;
                (!already_paused).then_some(TrackerEvent::Paused { offset })
            }
            PlayerState::Loading => None,
        }
    }

    fn close(&mut self, now: Instant) -> TrackerEvent {
        let offset = self.offset_at(now);
        self.last_offset = offset;
        self.phase = Phase::Closed;
        TrackerEvent::Closed { offset }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

/// Drives a [`TrackerState`] from live channels and reports to a host.
pub struct PlaybackTracker {
    host: Arc<dyn TrackerHost>,
    state: TrackerState,
}

impl PlaybackTracker {
    pub fn new(host: Arc<dyn TrackerHost>, app_id: impl Into<String>) -> Self {
        Self {
            host,
            state: TrackerState::new(app_id),
        }
    }

    /// Applies a status received before the tracker subscribed, such as the
    /// one that confirmed the LOAD. No host callbacks fire for it.
    pub fn seeded(mut self, entry: MediaStatusEntry, received_at: Instant) -> Self {
        let status = ReceiverMessage::MediaStatus {
            status: vec![entry],
        };
        self.state.handle(&status, received_at);
        self.bind_current_media();
        self
    }

    /// Watches both channels until the session closes or both streams end.
    ///
    /// # Arguments
    /// * `app_messages` - Status messages on the application's media channel
    /// * `receiver_messages` - Messages on the receiver-status namespace
    pub async fn run(
        mut self,
        app_messages: MessageStream,
        receiver_messages: MessageStream,
    ) -> TrackerState {
        let mut messages = merge([app_messages, receiver_messages]);

        while let Some(message) = messages.next().await {
            let message = match ReceiverMessage::parse(&message.data) {
                Ok(message) => message,
                Err(e) => {
                    log::debug!("[Tracker] Skipping message: {}", e);
                    continue;
                }
            };

            let was_unbound = self.state.media_session_id().is_none();
            let events = self.state.handle(&message, Instant::now());
            if was_unbound {
                self.bind_current_media();
            }
            for event in events {
                self.report(event).await;
            }
            if self.state.is_closed() {
                break;
            }
        }

        self.state
    }

    fn bind_current_media(&self) {
        let Some(session_id) = self.state.media_session_id() else {
            return;
        };
        if let Some(mut media) = self.host.current_media() {
            log::debug!(
                "[Tracker] Bound {} to media session {}",
                media.content_id,
                session_id
            );
            media.media_session_id = Some(session_id);
            self.host.set_current_media(Some(media));
        }
    }

    async fn report(&self, event: TrackerEvent) {
        let media = self.host.current_media();
        match (event, media) {
            (TrackerEvent::Paused { offset }, Some(media)) => {
                log::debug!("[Tracker] {} paused at {:.1}s", media.content_id, offset);
                self.host.on_player_paused(&media, offset).await;
            }
            (TrackerEvent::Resumed { offset }, Some(media)) => {
                self.host.on_player_resumed(&media, offset).await;
            }
            (TrackerEvent::Closed { offset }, media) => {
                if let Some(media) = media {
                    log::info!("[Tracker] {} closed at {:.1}s", media.content_id, offset);
                    self.host.on_player_paused(&media, offset).await;
                }
                self.host.set_current_media(None);
                self.host.disconnect().await;
            }
            (event, None) => log::debug!("[Tracker] {:?} with no current media", event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use crate::transport::InboundMessage;

    const APP: &str = "B4B1E5";
    const OFFSET_TOLERANCE: Duration = Duration::from_millis(250);

    fn status(id: i64, state: &str, time: f64) -> ReceiverMessage {
        ReceiverMessage::parse(&media_status(id, state, time)).unwrap()
    }

    fn media_status(id: i64, state: &str, time: f64) -> Value {
        json!({"type": "MEDIA_STATUS", "status": [
            {"mediaSessionId": id, "currentTime": time, "playerState": state}
        ]})
    }

    fn assert_offset(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= OFFSET_TOLERANCE.as_secs_f64(),
            "offset {} not within tolerance of {}",
            actual,
            expected
        );
    }

    #[test]
    fn pause_offset_is_computed_from_wall_clock() {
        let mut state = TrackerState::new(APP);
        let t0 = Instant::now();

        let events = state.handle(&status(1, "PLAYING", 10.0), t0);
        assert_eq!(events, vec![TrackerEvent::Resumed { offset: 10.0 }]);

        // Receiver echoes its stale offset; the tracker must not trust it.
        let events = state.handle(&status(1, "PAUSED", 10.0), t0 + Duration::from_secs(3));
        let [TrackerEvent::Paused { offset }] = events[..] else {
            panic!("expected one pause, got {:?}", events);
        };
        assert_offset(offset, 13.0);
    }

    #[test]
    fn repeated_pause_reports_once() {
        let mut state = TrackerState::new(APP);
        let t0 = Instant::now();
        state.handle(&status(1, "PLAYING", 0.0), t0);
        assert_eq!(state.handle(&status(1, "BUFFERING", 0.0), t0).len(), 1);
        assert!(state.handle(&status(1, "PAUSED", 0.0), t0).is_empty());
    }

    #[test]
    fn close_fires_at_most_once() {
        let mut state = TrackerState::new(APP);
        let t0 = Instant::now();
        state.handle(&status(1, "PLAYING", 5.0), t0);

        let events = state.handle(&ReceiverMessage::Close, t0 + Duration::from_secs(2));
        assert!(matches!(events[..], [TrackerEvent::Closed { .. }]));

        assert!(state.handle(&status(1, "PAUSED", 7.0), t0).is_empty());
        assert!(state.handle(&ReceiverMessage::Close, t0).is_empty());
        assert!(state.is_closed());
    }

    #[test]
    fn idle_from_another_session_closes() {
        let mut state = TrackerState::new(APP);
        let t0 = Instant::now();
        state.handle(&status(1, "PLAYING", 0.0), t0);

        assert!(state.handle(&status(2, "PLAYING", 0.0), t0).is_empty());
        let events = state.handle(&status(2, "IDLE", 0.0), t0 + Duration::from_secs(4));
        let [TrackerEvent::Closed { offset }] = events[..] else {
            panic!("expected close, got {:?}", events);
        };
        assert_offset(offset, 4.0);
    }

    #[test]
    fn idle_from_same_session_pauses() {
        let mut state = TrackerState::new(APP);
        let t0 = Instant::now();
        state.handle(&status(1, "PLAYING", 0.0), t0);
        let events = state.handle(&status(1, "IDLE", 0.0), t0 + Duration::from_secs(1));
        assert!(matches!(events[..], [TrackerEvent::Paused { .. }]));
        assert!(!state.is_closed());
    }

    #[test]
    fn receiver_status_without_app_closes() {
        let mut state = TrackerState::new(APP);
        let t0 = Instant::now();
        let still_running = ReceiverMessage::parse(
            &json!({"type": "RECEIVER_STATUS", "status": {"applications": [{"appId": APP}]}}),
        )
        .unwrap();
        assert!(state.handle(&still_running, t0).is_empty());

        let gone = ReceiverMessage::parse(
            &json!({"type": "RECEIVER_STATUS", "status": {"applications": []}}),
        )
        .unwrap();
        assert!(matches!(
            state.handle(&gone, t0)[..],
            [TrackerEvent::Closed { .. }]
        ));
    }

    // ── Driver ──────────────────────────────────────────────────────────────

    #[derive(Debug, PartialEq)]
    enum Call {
        Paused(String, f64),
        Resumed,
        Disconnect,
    }

    struct RecordingHost {
        media: Mutex<Option<TrackedMedia>>,
        calls: mpsc::UnboundedSender<Call>,
    }

    #[async_trait]
    impl TrackerHost for RecordingHost {
        fn current_media(&self) -> Option<TrackedMedia> {
            self.media.lock().clone()
        }

        fn set_current_media(&self, media: Option<TrackedMedia>) {
            *self.media.lock() = media;
        }

        async fn on_player_paused(&self, media: &TrackedMedia, offset: f64) {
            let _ = self.calls.send(Call::Paused(media.content_id.clone(), offset));
        }

        async fn on_player_resumed(&self, _media: &TrackedMedia, _offset: f64) {
            let _ = self.calls.send(Call::Resumed);
        }

        async fn disconnect(&self) {
            let _ = self.calls.send(Call::Disconnect);
        }
    }

    struct Harness {
        host: Arc<RecordingHost>,
        calls: mpsc::UnboundedReceiver<Call>,
        app_tx: mpsc::UnboundedSender<InboundMessage>,
        receiver_tx: mpsc::UnboundedSender<InboundMessage>,
        tracker: tokio::task::JoinHandle<TrackerState>,
    }

    fn spawn_tracker() -> Harness {
        let (calls_tx, calls) = mpsc::unbounded_channel();
        let host = Arc::new(RecordingHost {
            media: Mutex::new(Some(TrackedMedia::new("ep42"))),
            calls: calls_tx,
        });
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
        let tracker = PlaybackTracker::new(host.clone(), APP);
        let tracker = tokio::spawn(tracker.run(
            UnboundedReceiverStream::new(app_rx).boxed(),
            UnboundedReceiverStream::new(receiver_rx).boxed(),
        ));
        Harness {
            host,
            calls,
            app_tx,
            receiver_tx,
            tracker,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reports_computed_offset_on_pause() {
        let mut h = spawn_tracker();

        h.app_tx
            .send(InboundMessage::new(media_status(7, "PLAYING", 30.0)))
            .unwrap();
        assert_eq!(h.calls.recv().await, Some(Call::Resumed));
        assert_eq!(
            h.host.current_media().unwrap().media_session_id,
            Some(7)
        );

        tokio::time::advance(Duration::from_secs(12)).await;
        h.app_tx
            .send(InboundMessage::new(media_status(7, "PAUSED", 30.0)))
            .unwrap();

        let Some(Call::Paused(content, offset)) = h.calls.recv().await else {
            panic!("expected pause callback");
        };
        assert_eq!(content, "ep42");
        assert_offset(offset, 42.0);
    }

    #[tokio::test(start_paused = true)]
    async fn app_leaving_receiver_closes_and_disconnects() {
        let mut h = spawn_tracker();

        h.app_tx
            .send(InboundMessage::new(media_status(7, "PLAYING", 0.0)))
            .unwrap();
        assert_eq!(h.calls.recv().await, Some(Call::Resumed));

        tokio::time::advance(Duration::from_secs(5)).await;
        h.receiver_tx
            .send(InboundMessage::new(
                json!({"type": "RECEIVER_STATUS", "status": {"applications": []}}),
            ))
            .unwrap();

        let Some(Call::Paused(_, offset)) = h.calls.recv().await else {
            panic!("expected close to report an offset");
        };
        assert_offset(offset, 5.0);
        assert_eq!(h.calls.recv().await, Some(Call::Disconnect));

        let state = h.tracker.await.unwrap();
        assert!(state.is_closed());
        assert!(h.host.current_media().is_none());

        // Tracker has stopped; nothing further is reported.
        let _ = h
            .app_tx
            .send(InboundMessage::new(media_status(7, "PAUSED", 0.0)));
        assert!(h.calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn seeded_status_drives_close_offset() {
        let (calls_tx, mut calls) = mpsc::unbounded_channel();
        let host = Arc::new(RecordingHost {
            media: Mutex::new(Some(TrackedMedia::new("ep42"))),
            calls: calls_tx,
        });
        let (_app_tx, app_rx) = mpsc::unbounded_channel();
        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();

        let loaded = MediaStatusEntry {
            media_session_id: 3,
            current_time: 600.0,
            player_state: PlayerState::Playing,
            idle_reason: None,
        };
        let tracker = PlaybackTracker::new(host.clone(), APP).seeded(loaded, Instant::now());
        assert_eq!(host.current_media().unwrap().media_session_id, Some(3));

        let tracker = tokio::spawn(tracker.run(
            UnboundedReceiverStream::new(app_rx).boxed(),
            UnboundedReceiverStream::new(receiver_rx).boxed(),
        ));

        tokio::time::advance(Duration::from_secs(60)).await;
        receiver_tx
            .send(InboundMessage::new(
                json!({"type": "RECEIVER_STATUS", "status": {"applications": []}}),
            ))
            .unwrap();

        let Some(Call::Paused(_, offset)) = calls.recv().await else {
            panic!("expected close to report an offset");
        };
        assert_offset(offset, 660.0);
        assert_eq!(calls.recv().await, Some(Call::Disconnect));
        assert!(tracker.await.unwrap().is_closed());
    }

    #[tokio::test]
    async fn malformed_messages_are_skipped() {
        let mut h = spawn_tracker();
        h.app_tx
            .send(InboundMessage::new(json!({"no": "type"})))
            .unwrap();
        h.app_tx.send(InboundMessage::new(json!({"type": "CLOSE"}))).unwrap();

        let Some(Call::Paused(_, offset)) = h.calls.recv().await else {
            panic!("expected close");
        };
        assert_eq!(offset, 0.0);
        assert_eq!(h.calls.recv().await, Some(Call::Disconnect));
        drop(h.receiver_tx);
    }
}
