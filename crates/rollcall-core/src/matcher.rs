//! Nearest-neighbour matching of a probe encoding against enrolled identities.

use crate::types::{BoundingBox, Encoding, EnrolledIdentity, RecognitionPath, RecognitionResult};

/// Default maximum Euclidean distance accepted as the same person.
pub const DEFAULT_TOLERANCE: f32 = 0.6;

/// Result of matching a probe encoding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Distance to the closest gallery entry, `None` for an empty gallery.
    pub distance: Option<f32>,
    /// Identity of the matched entry (only set when `matched`).
    pub identity_id: Option<String>,
}

impl MatchResult {
    /// Confidence as `1 - distance`, clamped to [0, 1].
    pub fn confidence(&self) -> Option<f32> {
        self.distance.map(|d| (1.0 - d).clamp(0.0, 1.0))
    }

    pub fn into_recognition(self, region: Option<BoundingBox>) -> RecognitionResult {
        let confidence = self.confidence();
        match (self.matched, self.identity_id, confidence) {
            (true, Some(id), Some(confidence)) => {
                RecognitionResult::matched(id, confidence, RecognitionPath::Classical, region)
            }
            _ => RecognitionResult::unrecognized(RecognitionPath::Classical),
        }
    }
}

/// Strategy for comparing a probe encoding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare<'a, I>(&self, probe: &Encoding, gallery: I, tolerance: f32) -> MatchResult
    where
        I: IntoIterator<Item = &'a EnrolledIdentity>;
}

/// Euclidean matcher: the globally closest entry within tolerance wins.
///
/// Every gallery entry is visited, so an identity enrolled later but closer
/// to the probe beats an earlier one that is merely within tolerance. On an
/// exact distance tie the entry seen first keeps the win. Entries at a
/// non-finite distance never win.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare<'a, I>(&self, probe: &Encoding, gallery: I, tolerance: f32) -> MatchResult
    where
        I: IntoIterator<Item = &'a EnrolledIdentity>,
    {
        let mut best: Option<(f32, &EnrolledIdentity)> = None;

        for entry in gallery {
            let distance = probe.euclidean_distance(&entry.encoding);
            if !distance.is_finite() {
                continue;
            }
            let closer = match best {
                None => true,
                Some((best_distance, _)) => distance < best_distance,
            };
            if closer {
                best = Some((distance, entry));
            }
        }

        match best {
            Some((distance, entry)) if distance <= tolerance => MatchResult {
                matched: true,
                distance: Some(distance),
                identity_id: Some(entry.identity_id.clone()),
            },
            Some((distance, _)) => MatchResult {
                matched: false,
                distance: Some(distance),
                identity_id: None,
            },
            None => MatchResult {
                matched: false,
                distance: None,
                identity_id: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ENCODING_DIM;

    fn encoding_with(first: f32) -> Encoding {
        let mut values = vec![0.0; ENCODING_DIM];
        values[0] = first;
        Encoding::new(values)
    }

    fn identity(id: &str, first: f32) -> EnrolledIdentity {
        EnrolledIdentity {
            identity_id: id.into(),
            encoding: encoding_with(first),
            source_crop_path: None,
            enrolled_at: String::new(),
        }
    }

    #[test]
    fn test_closest_wins_over_first_within_tolerance() {
        // Both entries are within tolerance; the later one is closer.
        let gallery = vec![identity("far", 0.5), identity("near", 0.1)];
        let result = EuclideanMatcher.compare(&encoding_with(0.0), &gallery, 0.6);
        assert!(result.matched);
        assert_eq!(result.identity_id.as_deref(), Some("near"));
        assert!((result.distance.unwrap() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_exact_tie_keeps_first() {
        let gallery = vec![identity("a", 0.25), identity("b", -0.25)];
        let result = EuclideanMatcher.compare(&encoding_with(0.0), &gallery, 0.6);
        assert_eq!(result.identity_id.as_deref(), Some("a"));
    }

    #[test]
    fn test_tolerance_boundary_inclusive() {
        let gallery = vec![identity("a", 0.0)];

        let at = EuclideanMatcher.compare(&encoding_with(0.5), &gallery, 0.5);
        assert!(at.matched, "distance == tolerance must match");
        assert_eq!(at.distance, Some(0.5));

        let past = EuclideanMatcher.compare(&encoding_with(0.5 + 1e-4), &gallery, 0.5);
        assert!(!past.matched, "distance > tolerance must not match");
        assert!(past.identity_id.is_none());
    }

    #[test]
    fn test_non_finite_entry_does_not_mask_closer_match() {
        let mut poisoned = identity("aaa", 0.0);
        poisoned.encoding.values[1] = f32::NAN;
        let gallery = vec![poisoned, identity("bob", 0.0)];

        let result = EuclideanMatcher.compare(&encoding_with(0.0), &gallery, 0.6);
        assert!(result.matched);
        assert_eq!(result.identity_id.as_deref(), Some("bob"));
        assert_eq!(result.distance, Some(0.0));
    }

    #[test]
    fn test_non_finite_probe_is_unrecognized() {
        let gallery = vec![identity("a", 0.0)];
        let result = EuclideanMatcher.compare(&encoding_with(f32::NAN), &gallery, 0.6);
        assert!(!result.matched);
        assert_eq!(result.distance, None);
    }

    #[test]
    fn test_empty_gallery() {
        let gallery: Vec<EnrolledIdentity> = Vec::new();
        let result = EuclideanMatcher.compare(&encoding_with(0.0), &gallery, 10.0);
        assert!(!result.matched);
        assert_eq!(result.distance, None);
        assert_eq!(result.confidence(), None);
    }

    #[test]
    fn test_confidence_from_distance() {
        let gallery = vec![identity("a", 0.0)];
        let result = EuclideanMatcher.compare(&encoding_with(0.25), &gallery, 0.6);
        assert_eq!(result.confidence(), Some(0.75));

        let recognition = result.into_recognition(None);
        assert!(recognition.recognized);
        assert_eq!(recognition.identity_id.as_deref(), Some("a"));
        assert_eq!(recognition.confidence, Some(0.75));
        assert_eq!(recognition.path, RecognitionPath::Classical);
    }

    #[test]
    fn test_confidence_clamped_for_large_distance() {
        let gallery = vec![identity("a", 0.0)];
        let result = EuclideanMatcher.compare(&encoding_with(1.5), &gallery, 2.0);
        assert!(result.matched);
        assert_eq!(result.confidence(), Some(0.0));
    }

    #[test]
    fn test_no_match_converts_to_unrecognized() {
        let gallery = vec![identity("a", 0.0)];
        let result = EuclideanMatcher.compare(&encoding_with(0.9), &gallery, 0.6);
        let recognition = result.into_recognition(None);
        assert!(!recognition.recognized);
        assert_eq!(recognition.identity_id, None);
        assert_eq!(recognition.confidence, None);
    }
}
