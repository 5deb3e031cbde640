//! Deterministic identity matching against registry centroids.
//!
//! Distances are Euclidean on unit-norm vectors (range 0-2, since
//! d^2 = 2 * (1 - cos theta)). Bands: STRICT <= 0.80 matches and
//! learns, LOOSE <= 1.00 matches only, anything above is unknown.
//! Exact ties resolve to the lowest person_id.

use anyhow::Result;

use crate::config::MatchingConfig;
use crate::db::registry::{normalize_embedding, CentroidEntry};
use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchBand {
    Strict,
    Loose,
}

/// A resolved face identity.
#[derive(Debug, Clone)]
pub struct FaceMatch {
    pub person_id: i64,
    pub display_name: String,
    pub output_folder_rel: String,
    pub distance: f32,
    pub band: MatchBand,
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::MAX;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

pub struct Matcher<'a> {
    db: &'a Database,
    selected: Option<Vec<i64>>,
    centroids: Vec<CentroidEntry>,
    threshold_strict: f32,
    threshold_loose: f32,
}

impl<'a> Matcher<'a> {
    pub fn new(
        db: &'a Database,
        selected: Option<Vec<i64>>,
        matching: &MatchingConfig,
    ) -> Result<Self> {
        let mut matcher = Self {
            db,
            selected,
            centroids: Vec::new(),
            threshold_strict: matching.threshold_strict,
            threshold_loose: matching.threshold_loose,
        };
        matcher.refresh()?;
        Ok(matcher)
    }

    /// Reload the centroid snapshot from the registry.
    pub fn refresh(&mut self) -> Result<()> {
        self.centroids = self.db.load_centroids(self.selected.as_deref())?;
        Ok(())
    }

    pub fn candidate_count(&self) -> usize {
        self.centroids.len()
    }

    /// Match one face embedding. Returns None for UNKNOWN. A STRICT
    /// match appends the embedding to the person's set (FIFO-capped)
    /// and refreshes the snapshot so the new centroid takes effect
    /// immediately.
    pub fn match_face(&mut self, embedding: &[f32]) -> Result<Option<FaceMatch>> {
        if self.centroids.is_empty() {
            return Ok(None);
        }

        let probe = normalize_embedding(embedding);

        // Centroids are loaded in ascending person_id order, so strict
        // `<` comparison makes exact ties resolve to the lowest id.
        let mut entry = &self.centroids[0];
        let mut distance = euclidean_distance(&probe, &entry.centroid);
        for candidate in &self.centroids[1..] {
            let d = euclidean_distance(&probe, &candidate.centroid);
            if d < distance {
                distance = d;
                entry = candidate;
            }
        }

        if distance > self.threshold_loose {
            return Ok(None);
        }

        let band = if distance <= self.threshold_strict {
            MatchBand::Strict
        } else {
            MatchBand::Loose
        };
        let matched = FaceMatch {
            person_id: entry.person_id,
            display_name: entry.display_name.clone(),
            output_folder_rel: entry.output_folder_rel.clone(),
            distance,
            band,
        };

        if band == MatchBand::Strict {
            self.db.learn(matched.person_id, &probe)?;
            self.refresh()?;
        }

        Ok(Some(matched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[axis] = 1.0;
        v
    }

    /// A vector at a chosen Euclidean distance d from e_axis, on the
    /// plane spanned by e_axis and e_other. For unit vectors,
    /// cos theta = 1 - d^2 / 2.
    fn at_distance(dim: usize, axis: usize, other: usize, d: f32) -> Vec<f32> {
        let cos = 1.0 - d * d / 2.0;
        let sin = (1.0 - cos * cos).sqrt();
        let mut v = vec![0.0f32; dim];
        v[axis] = cos;
        v[other] = sin;
        v
    }

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn strict_match_learns_an_embedding() {
        let db = test_db();
        let alice = db.add_person("Alice", "Alice", &unit(8, 0)).unwrap();
        let mut matcher = Matcher::new(&db, None, &MatchingConfig::default()).unwrap();

        let probe = at_distance(8, 0, 1, 0.5);
        let m = matcher.match_face(&probe).unwrap().unwrap();
        assert_eq!(m.person_id, alice);
        assert_eq!(m.band, MatchBand::Strict);
        assert!((m.distance - 0.5).abs() < 1e-3);

        // Learned: Alice now has the reference plus one learned entry
        let person = db.get_person(alice).unwrap().unwrap();
        assert_eq!(person.embedding_count, 2);
        let (_, count) = db.get_centroid(alice).unwrap().unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn loose_match_does_not_learn() {
        let db = test_db();
        let alice = db.add_person("Alice", "Alice", &unit(8, 0)).unwrap();
        let mut matcher = Matcher::new(&db, None, &MatchingConfig::default()).unwrap();

        let probe = at_distance(8, 0, 1, 0.9);
        let m = matcher.match_face(&probe).unwrap().unwrap();
        assert_eq!(m.band, MatchBand::Loose);
        assert_eq!(db.get_person(alice).unwrap().unwrap().embedding_count, 1);
    }

    #[test]
    fn unknown_above_loose_threshold() {
        let db = test_db();
        let alice = db.add_person("Alice", "Alice", &unit(8, 0)).unwrap();
        let mut matcher = Matcher::new(&db, None, &MatchingConfig::default()).unwrap();

        let probe = at_distance(8, 0, 1, 1.21);
        assert!(matcher.match_face(&probe).unwrap().is_none());
        assert_eq!(db.get_person(alice).unwrap().unwrap().embedding_count, 1);
    }

    #[test]
    fn band_boundaries_are_inclusive() {
        let db = test_db();
        db.add_person("Alice", "Alice", &unit(8, 0)).unwrap();
        let mut matcher = Matcher::new(&db, None, &MatchingConfig::default()).unwrap();

        let at_strict = matcher
            .match_face(&at_distance(8, 0, 1, 0.7999))
            .unwrap()
            .unwrap();
        assert_eq!(at_strict.band, MatchBand::Strict);

        let at_loose = matcher
            .match_face(&at_distance(8, 0, 1, 0.9999))
            .unwrap()
            .unwrap();
        assert_eq!(at_loose.band, MatchBand::Loose);
    }

    #[test]
    fn exact_tie_resolves_to_lowest_person_id() {
        let db = test_db();
        let first = db.add_person("Alice", "Alice", &unit(8, 0)).unwrap();
        let second = db.add_person("Bob", "Bob", &unit(8, 0)).unwrap();
        assert!(first < second);

        let mut matcher = Matcher::new(&db, None, &MatchingConfig::default()).unwrap();
        let m = matcher.match_face(&unit(8, 0)).unwrap().unwrap();
        assert_eq!(m.person_id, first);
    }

    #[test]
    fn selection_restricts_candidates() {
        let db = test_db();
        let _alice = db.add_person("Alice", "Alice", &unit(8, 0)).unwrap();
        let bob = db.add_person("Bob", "Bob", &unit(8, 1)).unwrap();

        let mut matcher = Matcher::new(&db, Some(vec![bob]), &MatchingConfig::default()).unwrap();
        assert_eq!(matcher.candidate_count(), 1);
        // A probe on Alice's axis is far from Bob's centroid
        assert!(matcher.match_face(&unit(8, 0)).unwrap().is_none());
        let m = matcher.match_face(&unit(8, 1)).unwrap().unwrap();
        assert_eq!(m.person_id, bob);
    }

    #[test]
    fn empty_registry_matches_nothing() {
        let db = test_db();
        let mut matcher = Matcher::new(&db, None, &MatchingConfig::default()).unwrap();
        assert!(matcher.match_face(&unit(8, 0)).unwrap().is_none());
    }

    #[test]
    fn unnormalized_probe_is_normalized_before_scoring() {
        let db = test_db();
        let alice = db.add_person("Alice", "Alice", &unit(8, 0)).unwrap();
        let mut matcher = Matcher::new(&db, None, &MatchingConfig::default()).unwrap();

        let scaled: Vec<f32> = unit(8, 0).iter().map(|x| x * 42.0).collect();
        let m = matcher.match_face(&scaled).unwrap().unwrap();
        assert_eq!(m.person_id, alice);
        assert!(m.distance < 1e-3);
    }
}
