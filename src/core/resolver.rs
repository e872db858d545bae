use crate::core::database::FaceDatabase;
use crate::core::identity::{FaceEncoding, Identity};
use crate::core::pipeline::FaceComparator;

/// Maps each face of a frame to a student using first-match-wins.
///
/// The comparator's boolean answer is taken as-is: the first candidate it
/// accepts, in database order, is the match even if a later candidate is
/// closer.
pub struct IdentityResolver<'a> {
    comparator: &'a dyn FaceComparator,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(comparator: &'a dyn FaceComparator) -> Self {
        Self { comparator }
    }

    pub fn resolve(&self, frame_encodings: &[FaceEncoding], database: &FaceDatabase) -> Vec<Identity> {
        frame_encodings
            .iter()
            .map(|query| self.resolve_one(query, database))
            .collect()
    }

    fn resolve_one(&self, query: &FaceEncoding, database: &FaceDatabase) -> Identity {
        let matches = self.comparator.compare(database.encodings(), query);

        matches
            .iter()
            .position(|&matched| matched)
            .and_then(|index| database.student(index))
            .map(|student| Identity::Known(student.clone()))
            .unwrap_or(Identity::Unknown)
    }
}
