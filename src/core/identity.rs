use std::fmt;

/// Sentinel reported for faces that match nobody in the database.
pub const UNKNOWN: &str = "Unknown";

/// Face embedding produced by the encoding model. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEncoding(Box<[f32]>);

impl FaceEncoding {
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<f32>> for FaceEncoding {
    fn from(values: Vec<f32>) -> Self {
        Self(values.into_boxed_slice())
    }
}

/// Student identifier, `<student_id>-<university>` by convention.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StudentId(String);

impl StudentId {
    /// `None` for the empty string and the reserved `Unknown` sentinel.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() || id == UNKNOWN {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StudentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of resolving one face.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Known(StudentId),
    Unknown,
}

impl Identity {
    pub fn student(&self) -> Option<&StudentId> {
        match self {
            Identity::Known(id) => Some(id),
            Identity::Unknown => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Identity::Known(id) => id.as_str(),
            Identity::Unknown => UNKNOWN,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
