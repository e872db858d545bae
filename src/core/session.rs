use crate::common::{AttendanceError, Result};
use crate::core::database::FaceDatabase;
use crate::core::pipeline::{
    DetectionModel, EncodingModel, FaceComparator, FaceEncoder, FaceLocator, PreviewRenderer,
    VideoSource,
};
use crate::core::reporter::{AttendanceReporter, Clock, FlushOutcome, LocalClock};
use crate::core::resolver::IdentityResolver;
use crate::service::client::ServerEndpoint;
use crate::service::transport::MessageSink;
use image::{imageops::FilterType, DynamicImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Tunables that shape every cycle.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub scale_frame: f32,
    pub detection_model: DetectionModel,
    pub encoding_model: EncodingModel,
}

impl SessionSettings {
    /// Boxes are scaled back by `1 / scale_frame`, so the factor must be in (0, 1].
    pub fn validate(&self) -> Result<()> {
        if !(self.scale_frame > 0.0 && self.scale_frame <= 1.0) {
            return Err(AttendanceError::Config(format!(
                "Frame scale must be in (0.0, 1.0], got {}", self.scale_frame
            )));
        }
        Ok(())
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            scale_frame: 0.5,
            detection_model: DetectionModel::default(),
            encoding_model: EncodingModel::default(),
        }
    }
}

/// Shared stop flag; set from a signal handler, read once per cycle.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    QuitRequested,
    StreamEnded,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub frames: u64,
    pub faces: u64,
    pub identified: u64,
    pub flushes: u64,
    pub stop_reason: StopReason,
}

/// A connected attendance session: server endpoint plus the face database
/// it handed out.
pub struct Session {
    endpoint: ServerEndpoint,
    database: FaceDatabase,
    settings: SessionSettings,
}

impl Session {
    /// Blocks until the face database has been received.
    pub fn start(endpoint: ServerEndpoint, settings: SessionSettings) -> Result<Self> {
        settings.validate()?;
        tracing::info!("Session started, receiving session data from {}", endpoint.host());
        let database = endpoint.fetch_database()?;
        Self::from_parts(endpoint, database, settings)
    }

    pub fn from_parts(endpoint: ServerEndpoint, database: FaceDatabase, settings: SessionSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { endpoint, database, settings })
    }

    pub fn database(&self) -> &FaceDatabase {
        &self.database
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }
}

/// External pieces a session loop drives each cycle.
pub struct Collaborators<'a> {
    pub source: &'a mut dyn VideoSource,
    pub locator: &'a dyn FaceLocator,
    pub encoder: &'a dyn FaceEncoder,
    pub comparator: &'a dyn FaceComparator,
    pub preview: Option<&'a mut dyn PreviewRenderer>,
}

/// Capture, identify, report, repeat. Single threaded: a slow send delays
/// the next frame.
pub struct SessionLoop<'a, C: Clock = LocalClock> {
    session: &'a Session,
    parts: Collaborators<'a>,
    reporter: AttendanceReporter<C>,
    stop: StopSignal,
}

impl<'a> SessionLoop<'a, LocalClock> {
    pub fn new(session: &'a Session, parts: Collaborators<'a>, stop: StopSignal) -> Self {
        Self::with_reporter(session, parts, stop, AttendanceReporter::new())
    }
}

impl<'a, C: Clock> SessionLoop<'a, C> {
    pub fn with_reporter(
        session: &'a Session,
        parts: Collaborators<'a>,
        stop: StopSignal,
        reporter: AttendanceReporter<C>,
    ) -> Self {
        Self { session, parts, reporter, stop }
    }

    /// Runs until quit, end of stream, the stop signal or a fatal error.
    /// Channel, video source and preview are released on every path.
    pub fn run(mut self) -> Result<SessionSummary> {
        let result = self
            .session
            .endpoint
            .open_attendance_channel()
            .and_then(|mut channel| {
                let outcome = self.drive(&mut channel);
                channel.close();
                outcome
            });

        self.release();

        match &result {
            Ok(summary) => tracing::info!(
                "Session ended ({:?}): {} frames, {} faces, {} identified, {} records sent",
                summary.stop_reason, summary.frames, summary.faces, summary.identified, summary.flushes
            ),
            Err(e) => tracing::error!("Session aborted: {}", e),
        }
        result
    }

    /// The cycle loop against any outbound sink.
    pub fn drive<S: MessageSink + ?Sized>(&mut self, sink: &mut S) -> Result<SessionSummary> {
        let mut summary = SessionSummary {
            frames: 0,
            faces: 0,
            identified: 0,
            flushes: 0,
            stop_reason: StopReason::StreamEnded,
        };

        loop {
            if self.stop.is_requested() {
                summary.stop_reason = StopReason::Interrupted;
                break;
            }

            let frame = match self.parts.source.next_frame()? {
                Some(frame) => frame,
                None => {
                    summary.stop_reason = StopReason::StreamEnded;
                    break;
                }
            };

            if self.run_cycle(&frame, sink, &mut summary)? {
                summary.stop_reason = StopReason::QuitRequested;
                break;
            }
        }

        Ok(summary)
    }

    /// One frame; returns whether the preview asked to quit.
    fn run_cycle<S: MessageSink + ?Sized>(
        &mut self,
        frame: &DynamicImage,
        sink: &mut S,
        summary: &mut SessionSummary,
    ) -> Result<bool> {
        let cycle_start = Instant::now();
        let session = self.session;
        let settings = &session.settings;
        let small = scale_frame(frame, settings.scale_frame);

        let faces = self.parts.locator.locate(&small, settings.detection_model)?;
        let encodings = if faces.is_empty() {
            Vec::new()
        } else {
            self.parts.encoder.encode(&small, &faces, settings.encoding_model)?
        };

        let identities = IdentityResolver::new(self.parts.comparator)
            .resolve(&encodings, &session.database);

        let outcome = self.reporter.complete_cycle(&identities, sink)?;

        summary.frames += 1;
        summary.faces += identities.len() as u64;
        summary.identified += identities.iter().filter(|i| i.student().is_some()).count() as u64;
        if let FlushOutcome::Sent { .. } = outcome {
            summary.flushes += 1;
        }

        tracing::debug!(
            "Frame {}: {} faces, {:?}, {:.1}ms",
            summary.frames,
            identities.len(),
            outcome,
            cycle_start.elapsed().as_secs_f32() * 1000.0
        );

        let quit = match self.parts.preview.as_deref_mut() {
            Some(preview) => {
                let full_size: Vec<_> = faces
                    .iter()
                    .map(|face| face.scaled(1.0 / settings.scale_frame))
                    .collect();
                preview.render(frame, &full_size, &identities)?
            }
            None => false,
        };

        Ok(quit)
    }

    fn release(&mut self) {
        self.parts.source.release();
        if let Some(preview) = self.parts.preview.as_deref_mut() {
            preview.close();
        }
    }
}

/// Shrinks a frame for detection; a factor of 1.0 leaves it untouched.
pub fn scale_frame(frame: &DynamicImage, factor: f32) -> DynamicImage {
    if (factor - 1.0).abs() < f32::EPSILON {
        return frame.clone();
    }
    let width = ((frame.width() as f32 * factor).round() as u32).max(1);
    let height = ((frame.height() as f32 * factor).round() as u32).max(1);
    frame.resize_exact(width, height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_frame_halves_dimensions() {
        let frame = DynamicImage::new_luma8(640, 480);
        let small = scale_frame(&frame, 0.5);
        assert_eq!((small.width(), small.height()), (320, 240));
    }

    #[test]
    fn test_scale_frame_never_collapses_to_zero() {
        let frame = DynamicImage::new_luma8(3, 3);
        let small = scale_frame(&frame, 0.1);
        assert_eq!((small.width(), small.height()), (1, 1));
    }

    #[test]
    fn test_session_rejects_out_of_range_scale() {
        for scale_frame in [0.0, -0.5, 1.5, f32::NAN] {
            let settings = SessionSettings { scale_frame, ..SessionSettings::default() };
            let err = Session::from_parts(ServerEndpoint::new("127.0.0.1"), FaceDatabase::default(), settings)
                .err()
                .unwrap();
            assert!(matches!(err, AttendanceError::Config(_)), "{}", err);
        }

        let settings = SessionSettings { scale_frame: 1.0, ..SessionSettings::default() };
        assert!(Session::from_parts(ServerEndpoint::new("127.0.0.1"), FaceDatabase::default(), settings).is_ok());
    }

    #[test]
    fn test_stop_signal_is_shared() {
        let signal = StopSignal::new();
        let handle = signal.clone();
        assert!(!signal.is_requested());
        handle.request();
        assert!(signal.is_requested());
    }
}
