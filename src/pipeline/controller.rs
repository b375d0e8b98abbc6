// =============================================================================
// PLAYBACK CONTROLLER - OWNING THREAD FOR THE ENGINE
// =============================================================================
//
// The engine lives on one thread. Callers send commands and block on a reply;
// workers report through the engine's completion channel. Between messages
// the thread fires whichever read/display ticks are due.
//
// =============================================================================

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use tokio::sync::broadcast;

use super::engine::PlaybackEngine;
use crate::core::{EventBus, OutputNaming, PipelineEvent, Segment};

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Commands accepted by the playback thread
#[derive(Debug)]
pub enum ControlCommand {
    Play,
    /// Record from the scrub position to the end of the media
    Record(OutputNaming),
    /// Record the given frame ranges and join them into one file
    RecordSegments(Vec<Segment>, OutputNaming),
    Stop,
    Seek(u64),
    ProcessCurrentFrame,
    SetThreads(usize),
    Shutdown,
}

struct Request {
    command: ControlCommand,
    reply: Sender<bool>,
}

pub struct PlaybackController {
    commands: Sender<Request>,
    events: EventBus,
    thread_handle: Option<JoinHandle<()>>,
}

impl PlaybackController {
    pub fn spawn(engine: PlaybackEngine) -> std::io::Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let events = engine.events().clone();

        let thread_handle = thread::Builder::new()
            .name("playback-controller".to_string())
            .spawn(move || controller_thread(engine, cmd_rx))?;

        Ok(Self {
            commands: cmd_tx,
            events,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn play(&self) -> bool {
        self.send(ControlCommand::Play)
    }

    pub fn record(&self, naming: OutputNaming) -> bool {
        self.send(ControlCommand::Record(naming))
    }

    pub fn record_segments(&self, segments: Vec<Segment>, naming: OutputNaming) -> bool {
        self.send(ControlCommand::RecordSegments(segments, naming))
    }

    pub fn stop(&self) -> bool {
        self.send(ControlCommand::Stop)
    }

    pub fn seek(&self, index: u64) -> bool {
        self.send(ControlCommand::Seek(index))
    }

    pub fn process_current_frame(&self) -> bool {
        self.send(ControlCommand::ProcessCurrentFrame)
    }

    pub fn set_threads(&self, count: usize) -> bool {
        self.send(ControlCommand::SetThreads(count))
    }

    /// Stop everything and join the playback thread.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    /// Send a command and wait for the playback thread's answer.
    pub fn send(&self, command: ControlCommand) -> bool {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        if self
            .commands
            .send(Request {
                command,
                reply: reply_tx,
            })
            .is_err()
        {
            log::warn!("Playback thread is gone, command dropped");
            return false;
        }
        reply_rx.recv().unwrap_or(false)
    }

    fn shutdown_inner(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.send(ControlCommand::Shutdown);
            if handle.join().is_err() {
                log::error!("Playback thread panicked");
            }
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        log::debug!("PlaybackController dropping");
        self.shutdown_inner();
    }
}

fn controller_thread(mut engine: PlaybackEngine, cmd_rx: Receiver<Request>) {
    log::info!("Playback thread started");
    let completions = engine.completions();

    loop {
        let timeout = engine
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            .unwrap_or(IDLE_WAIT);

        select! {
            recv(cmd_rx) -> msg => match msg {
                Ok(Request { command, reply }) => {
                    let shutdown = matches!(command, ControlCommand::Shutdown);
                    let accepted = apply_command(&mut engine, command);
                    let _ = reply.send(accepted);
                    if shutdown {
                        break;
                    }
                }
                Err(_) => {
                    log::info!("Command channel disconnected, shutting down");
                    engine.stop();
                    break;
                }
            },
            recv(completions) -> done => {
                if let Ok(done) = done {
                    engine.handle_worker_done(done);
                }
            },
            default(timeout) => {}
        }

        engine.run_due_ticks(Instant::now());
    }

    log::info!("Playback thread exited");
}

fn apply_command(engine: &mut PlaybackEngine, command: ControlCommand) -> bool {
    log::debug!("Playback command: {:?}", command);
    match command {
        ControlCommand::Play => engine.play(),
        ControlCommand::Record(naming) => engine.record(&naming),
        ControlCommand::RecordSegments(segments, naming) => engine.record_segments(segments, &naming),
        ControlCommand::Stop => engine.stop(),
        ControlCommand::Seek(index) => engine.seek(index),
        ControlCommand::ProcessCurrentFrame => engine.process_current_frame(),
        ControlCommand::SetThreads(count) => engine.set_threads(count),
        ControlCommand::Shutdown => {
            engine.stop();
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{read_frame_ids, test_config, MemorySource, MockEncoderBackend, RecordingSink};
    use crate::video::{EncoderBackend, IdentityTransform};
    use std::sync::Arc;

    fn spawn(frames: u64, dir: &std::path::Path) -> (PlaybackController, RecordingSink, MockEncoderBackend) {
        let sink = RecordingSink::default();
        let backend = MockEncoderBackend::new();
        let engine = PlaybackEngine::new(
            test_config(dir, 2),
            Box::new(MemorySource::new(frames, 100.0, 4, 4)),
            Arc::new(IdentityTransform),
            Box::new(sink.clone()),
            Box::new(backend.clone()),
            EventBus::new(),
        );
        (PlaybackController::spawn(engine).unwrap(), sink, backend)
    }

    fn wait_for(
        rx: &mut broadcast::Receiver<PipelineEvent>,
        predicate: impl Fn(&PipelineEvent) -> bool,
    ) -> Option<PipelineEvent> {
        let deadline = Instant::now() + Duration::from_secs(20);
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
        None
    }

    #[test]
    fn test_play_runs_to_end_on_owning_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, sink, _backend) = spawn(20, dir.path());
        let mut rx = controller.subscribe();

        assert!(controller.play());
        assert!(!controller.play());
        assert!(wait_for(&mut rx, |e| *e == PipelineEvent::Stopped).is_some());
        assert_eq!(sink.presented(), (0..20).collect::<Vec<_>>());
        assert!(!controller.stop());

        controller.shutdown();
    }

    #[test]
    fn test_segment_job_through_controller() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _sink, backend) = spawn(40, dir.path());
        let mut rx = controller.subscribe();
        let naming = OutputNaming {
            output_file_name: Some("job".to_string()),
            ..OutputNaming::default()
        };

        let segments = vec![Segment::new(0, 4).unwrap(), Segment::new(10, 14).unwrap()];
        assert!(controller.record_segments(segments, naming));

        let done = wait_for(&mut rx, |e| matches!(e, PipelineEvent::AllSegmentsDone { .. }));
        let output = dir.path().join("out").join("job.mp4");
        assert_eq!(done, Some(PipelineEvent::AllSegmentsDone { output: Some(output.clone()) }));
        assert_eq!(read_frame_ids(&output), vec![0, 1, 2, 3, 4, 10, 11, 12, 13, 14]);
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn test_open_ended_segment_keeps_thread_alive() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _sink, _backend) = spawn(20, dir.path());
        let mut rx = controller.subscribe();
        let naming = OutputNaming {
            output_file_name: Some("tail".to_string()),
            ..OutputNaming::default()
        };

        assert!(controller.record_segments(vec![Segment::new(15, u64::MAX).unwrap()], naming));
        let done = wait_for(&mut rx, |e| matches!(e, PipelineEvent::AllSegmentsDone { .. }));
        let output = dir.path().join("out").join("tail.mp4");
        assert_eq!(done, Some(PipelineEvent::AllSegmentsDone { output: Some(output.clone()) }));
        assert_eq!(read_frame_ids(&output), vec![15, 16, 17, 18, 19]);

        assert!(controller.play());
        controller.shutdown();
    }

    #[test]
    fn test_stop_and_drop_release_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, _sink, backend) = spawn(10_000, dir.path());

        assert!(controller.record(OutputNaming::default()));
        thread::sleep(Duration::from_millis(50));
        assert!(controller.stop());
        assert!(!controller.stop());
        assert_eq!(backend.live_sessions(), 0);

        assert!(controller.play());
        drop(controller);
        assert_eq!(backend.live_sessions(), 0);
    }

    #[test]
    fn test_set_threads_and_seek_commands() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, sink, _backend) = spawn(30, dir.path());

        assert!(controller.set_threads(3));
        assert!(controller.seek(12));
        assert!(controller.process_current_frame());
        assert_eq!(sink.presented(), vec![12]);
        controller.shutdown();
    }
}
