pub mod comparator;
pub mod database;
pub mod detector;
pub mod identity;
pub mod pipeline;
pub mod recognizer;
pub mod reporter;
pub mod resolver;
pub mod session;

pub use comparator::DistanceComparator;
pub use database::FaceDatabase;
pub use detector::OnnxFaceLocator;
pub use identity::{FaceEncoding, Identity, StudentId};
pub use pipeline::{DetectionModel, EncodingModel, FaceBox};
pub use recognizer::OnnxFaceEncoder;
pub use reporter::AttendanceReporter;
pub use resolver::IdentityResolver;
pub use session::{Collaborators, Session, SessionLoop, SessionSettings, StopSignal};
