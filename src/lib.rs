pub mod camera;
pub mod cli;
pub mod common;
pub mod core;
pub mod service;

pub use common::{AttendanceError, Config, Paths, Result};
pub use core::{
    AttendanceReporter, DetectionModel, DistanceComparator, EncodingModel, FaceBox, FaceDatabase,
    FaceEncoding, Identity, IdentityResolver, Session, SessionLoop, SessionSettings, StopSignal,
    StudentId,
};
pub use service::{ChunkedChannel, MessageSink, ServerEndpoint};
