use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpListener;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use image::DynamicImage;

use class_attendance::core::pipeline::{
    FaceEncoder, FaceLocator, PreviewRenderer, VideoSource,
};
use class_attendance::core::session::{Collaborators, SessionSettings, StopReason};
use class_attendance::service::protocol::decode_string_map;
use class_attendance::service::transport::send_chunked;
use class_attendance::{
    AttendanceError, ChunkedChannel, DetectionModel, DistanceComparator, EncodingModel, FaceBox,
    FaceEncoding, Identity, ServerEndpoint, Session, SessionLoop, StopSignal,
};

const KNOWN: [f32; 3] = [0.1, 0.2, 0.3];
const STRANGER: [f32; 3] = [5.0, 5.0, 5.0];

/// Plays back a fixed list of frames, then reports end of stream.
struct ScriptedSource {
    frames: VecDeque<DynamicImage>,
    delay: Duration,
    served: usize,
    released: bool,
}

impl ScriptedSource {
    fn new(count: usize) -> Self {
        Self {
            frames: (0..count).map(|_| DynamicImage::new_rgb8(64, 48)).collect(),
            delay: Duration::ZERO,
            served: 0,
            released: false,
        }
    }
}

impl VideoSource for ScriptedSource {
    fn next_frame(&mut self) -> class_attendance::Result<Option<DynamicImage>> {
        thread::sleep(self.delay);
        let frame = self.frames.pop_front();
        if frame.is_some() {
            self.served += 1;
        }
        Ok(frame)
    }

    fn release(&mut self) {
        self.released = true;
    }
}

/// Each frame yields the next scripted list of face encodings.
struct ScriptedFaces {
    per_frame: RefCell<VecDeque<Vec<[f32; 3]>>>,
    current: RefCell<Vec<[f32; 3]>>,
}

impl ScriptedFaces {
    fn new(per_frame: Vec<Vec<[f32; 3]>>) -> Self {
        Self { per_frame: RefCell::new(per_frame.into()), current: RefCell::new(Vec::new()) }
    }

    fn every_frame(frames: usize, faces: Vec<[f32; 3]>) -> Self {
        Self::new(vec![faces; frames])
    }
}

impl FaceLocator for ScriptedFaces {
    fn locate(&self, _image: &DynamicImage, _model: DetectionModel) -> class_attendance::Result<Vec<FaceBox>> {
        let faces = self.per_frame.borrow_mut().pop_front().unwrap_or_default();
        let boxes = (0..faces.len())
            .map(|i| FaceBox { x1: i as f32 * 10.0, y1: 0.0, x2: i as f32 * 10.0 + 8.0, y2: 8.0, confidence: 0.9 })
            .collect();
        *self.current.borrow_mut() = faces;
        Ok(boxes)
    }
}

impl FaceEncoder for ScriptedFaces {
    fn encode(
        &self,
        _image: &DynamicImage,
        faces: &[FaceBox],
        _model: EncodingModel,
    ) -> class_attendance::Result<Vec<FaceEncoding>> {
        let current = self.current.borrow();
        assert_eq!(current.len(), faces.len());
        Ok(current.iter().map(|v| FaceEncoding::from(v.to_vec())).collect())
    }
}

/// Records what it was shown; asks to quit after `quit_after` frames.
#[derive(Default)]
struct RecordingPreview {
    quit_after: Option<usize>,
    rendered: Vec<(Vec<FaceBox>, Vec<Identity>)>,
    closed: bool,
}

impl PreviewRenderer for RecordingPreview {
    fn render(
        &mut self,
        _frame: &DynamicImage,
        faces: &[FaceBox],
        identities: &[Identity],
    ) -> class_attendance::Result<bool> {
        self.rendered.push((faces.to_vec(), identities.to_vec()));
        Ok(self.quit_after.is_some_and(|n| self.rendered.len() >= n))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

fn database_json() -> String {
    r#"{"(0.1, 0.2, 0.3)": "1001-ABC", "(9.0, 9.0, 9.0)": "2002-XYZ"}"#.to_string()
}

/// Serves one connection on the database port with raw bytes, then closes.
fn serve_raw(wire: Vec<u8>) -> Result<(u16, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let handle = thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let _ = stream.write_all(&wire);
        }
    });
    Ok((port, handle))
}

fn serve_database(json: String) -> Result<(u16, JoinHandle<()>)> {
    let mut wire = Vec::new();
    send_chunked(&mut wire, json.as_bytes(), 100_000)?;
    serve_raw(wire)
}

/// Collects every attendance message of one client connection.
fn attendance_server() -> Result<(u16, JoinHandle<Vec<Vec<(String, String)>>>)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let handle = thread::spawn(move || {
        let mut messages = Vec::new();
        let Ok((stream, _)) = listener.accept() else {
            return messages;
        };
        let mut channel = ChunkedChannel::from_stream("attendance", stream, 1024);
        while let Ok(Some(message)) = channel.receive_next() {
            messages.push(decode_string_map(&message).expect("attendance payload is a string map"));
        }
        messages
    });
    Ok((port, handle))
}

fn start_session(attendance_port: u16) -> Result<Session> {
    let (database_port, server) = serve_database(database_json())?;
    let endpoint = ServerEndpoint::new("127.0.0.1").with_ports(database_port, attendance_port);
    let session = Session::start(endpoint, SessionSettings::default())?;
    server.join().expect("database server thread");
    Ok(session)
}

#[test]
fn known_face_is_reported_once() -> Result<()> {
    let (attendance_port, attendance) = attendance_server()?;
    let session = start_session(attendance_port)?;
    assert_eq!(session.database().len(), 2);

    let mut source = ScriptedSource::new(1);
    let faces = ScriptedFaces::every_frame(1, vec![KNOWN]);
    let comparator = DistanceComparator::new(0.6);
    let mut preview = RecordingPreview::default();

    let summary = SessionLoop::new(
        &session,
        Collaborators {
            source: &mut source,
            locator: &faces,
            encoder: &faces,
            comparator: &comparator,
            preview: Some(&mut preview),
        },
        StopSignal::new(),
    )
    .run()?;

    assert_eq!(summary.stop_reason, StopReason::StreamEnded);
    assert_eq!((summary.frames, summary.faces, summary.identified, summary.flushes), (1, 1, 1, 1));

    let messages = attendance.join().expect("attendance server thread");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].len(), 1);
    assert_eq!(messages[0][0].0, "1001-ABC");
    assert!(!messages[0][0].1.is_empty());

    // preview gets boxes in full-frame coordinates
    let (boxes, identities) = &preview.rendered[0];
    assert_eq!(boxes[0].x2, 16.0);
    assert_eq!(identities[0].label(), "1001-ABC");
    assert!(source.released && preview.closed);
    Ok(())
}

#[test]
fn frames_without_known_faces_send_nothing() -> Result<()> {
    let (attendance_port, attendance) = attendance_server()?;
    let session = start_session(attendance_port)?;

    let mut source = ScriptedSource::new(3);
    let faces = ScriptedFaces::new(vec![vec![], vec![STRANGER], vec![STRANGER, STRANGER]]);
    let comparator = DistanceComparator::new(0.6);

    let summary = SessionLoop::new(
        &session,
        Collaborators {
            source: &mut source,
            locator: &faces,
            encoder: &faces,
            comparator: &comparator,
            preview: None,
        },
        StopSignal::new(),
    )
    .run()?;

    assert_eq!((summary.frames, summary.faces, summary.identified, summary.flushes), (3, 3, 0, 0));
    assert!(attendance.join().expect("attendance server thread").is_empty());
    assert!(source.released);
    Ok(())
}

#[test]
fn preview_quit_stops_the_loop() -> Result<()> {
    let (attendance_port, attendance) = attendance_server()?;
    let session = start_session(attendance_port)?;

    let mut source = ScriptedSource::new(10);
    let faces = ScriptedFaces::every_frame(10, vec![]);
    let comparator = DistanceComparator::new(0.6);
    let mut preview = RecordingPreview { quit_after: Some(2), ..Default::default() };

    let summary = SessionLoop::new(
        &session,
        Collaborators {
            source: &mut source,
            locator: &faces,
            encoder: &faces,
            comparator: &comparator,
            preview: Some(&mut preview),
        },
        StopSignal::new(),
    )
    .run()?;

    assert_eq!(summary.stop_reason, StopReason::QuitRequested);
    assert_eq!(summary.frames, 2);
    assert_eq!(source.served, 2);
    assert!(source.released && preview.closed);
    attendance.join().expect("attendance server thread");
    Ok(())
}

#[test]
fn stop_signal_ends_the_session() -> Result<()> {
    let (attendance_port, attendance) = attendance_server()?;
    let session = start_session(attendance_port)?;

    let mut source = ScriptedSource::new(5);
    let faces = ScriptedFaces::every_frame(5, vec![]);
    let comparator = DistanceComparator::new(0.6);
    let stop = StopSignal::new();
    stop.request();

    let summary = SessionLoop::new(
        &session,
        Collaborators {
            source: &mut source,
            locator: &faces,
            encoder: &faces,
            comparator: &comparator,
            preview: None,
        },
        stop,
    )
    .run()?;

    assert_eq!(summary.stop_reason, StopReason::Interrupted);
    assert_eq!(summary.frames, 0);
    assert!(source.released);
    attendance.join().expect("attendance server thread");
    Ok(())
}

#[test]
fn lost_attendance_server_aborts_and_releases() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let attendance_port = listener.local_addr()?.port();
    let hangup = thread::spawn(move || {
        let _ = listener.accept();
    });
    let session = start_session(attendance_port)?;

    let mut source = ScriptedSource::new(200);
    source.delay = Duration::from_millis(2);
    let faces = ScriptedFaces::every_frame(200, vec![KNOWN]);
    let comparator = DistanceComparator::new(0.6);
    let mut preview = RecordingPreview::default();

    let result = SessionLoop::new(
        &session,
        Collaborators {
            source: &mut source,
            locator: &faces,
            encoder: &faces,
            comparator: &comparator,
            preview: Some(&mut preview),
        },
        StopSignal::new(),
    )
    .run();
    hangup.join().expect("hangup thread");

    let err = result.expect_err("sending to a closed peer must fail");
    assert!(matches!(err, AttendanceError::Transport(_)), "{}", err);
    assert!(source.served < 200);
    assert!(source.released && preview.closed);
    Ok(())
}

#[test]
fn unreachable_attendance_server_releases_resources() -> Result<()> {
    // grab a free port, then close it again
    let attendance_port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
    let session = start_session(attendance_port)?;

    let mut source = ScriptedSource::new(1);
    let faces = ScriptedFaces::every_frame(1, vec![KNOWN]);
    let comparator = DistanceComparator::new(0.6);

    let err = SessionLoop::new(
        &session,
        Collaborators {
            source: &mut source,
            locator: &faces,
            encoder: &faces,
            comparator: &comparator,
            preview: None,
        },
        StopSignal::new(),
    )
    .run()
    .expect_err("connect must fail");

    assert!(matches!(err, AttendanceError::Transport(_)));
    assert_eq!(source.served, 0);
    assert!(source.released);
    Ok(())
}

#[test]
fn malformed_database_header_fails_load() -> Result<()> {
    let (port, server) = serve_raw(b"abc\n{}".to_vec())?;
    let endpoint = ServerEndpoint::new("127.0.0.1").with_ports(port, 1);

    let err = Session::start(endpoint, SessionSettings::default())
        .err()
        .expect("load must fail");
    server.join().expect("database server thread");

    assert!(matches!(err, AttendanceError::Protocol(_)), "{}", err);
    Ok(())
}

#[test]
fn bad_database_key_fails_load() -> Result<()> {
    let (port, server) = serve_database(r#"{"(0.1, oops)": "1001-ABC"}"#.to_string())?;
    let endpoint = ServerEndpoint::new("127.0.0.1").with_ports(port, 1);

    let err = endpoint.fetch_database().expect_err("load must fail");
    server.join().expect("database server thread");

    assert!(matches!(err, AttendanceError::KeyFormat(_)), "{}", err);
    Ok(())
}
