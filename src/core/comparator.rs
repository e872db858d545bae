use crate::core::identity::FaceEncoding;
use crate::core::pipeline::FaceComparator;

/// Accepts candidates within `tolerance` Euclidean distance of the query.
pub struct DistanceComparator {
    tolerance: f32,
}

impl DistanceComparator {
    pub fn new(tolerance: f32) -> Self {
        Self { tolerance }
    }
}

impl FaceComparator for DistanceComparator {
    fn compare(&self, candidates: &[FaceEncoding], query: &FaceEncoding) -> Vec<bool> {
        candidates
            .iter()
            .map(|candidate| {
                euclidean_distance(candidate.as_slice(), query.as_slice())
                    .map_or(false, |distance| distance <= self.tolerance)
            })
            .collect()
    }
}

/// `None` when the vectors differ in length.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let sum: f32 = a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum();
    Some(sum.sqrt())
}
