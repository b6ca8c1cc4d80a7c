//! Input validation and the per-collection embedding dimension

use crate::error::ValidationError;
use crate::vector_db::{CollectionKind, EmbeddingRecord, PathUpdate};
use dashmap::DashMap;

/// Check id and vector of one record; returns its dimension
pub fn validate_record(record: &EmbeddingRecord) -> Result<usize, ValidationError> {
    if record.id.trim().is_empty() {
        return Err(ValidationError::MissingId);
    }
    if record.vector.is_empty() {
        return Err(ValidationError::MissingVector(record.id.clone()));
    }
    if let Some(index) = record.vector.iter().position(|x| !x.is_finite()) {
        return Err(ValidationError::NonFiniteVector {
            id: record.id.clone(),
            index,
        });
    }
    Ok(record.dimension())
}

/// Check every record of a batch; `None` for an empty batch
pub fn validate_records(records: &[EmbeddingRecord]) -> Result<Option<usize>, ValidationError> {
    let mut dimension = None;
    for record in records {
        let dim = validate_record(record)?;
        match dimension {
            None => dimension = Some(dim),
            Some(first) if first != dim => {
                return Err(ValidationError::MixedDimensions { first, other: dim });
            }
            Some(_) => {}
        }
    }
    Ok(dimension)
}

/// Check a query vector; returns its dimension
pub fn validate_vector(vector: &[f32]) -> Result<usize, ValidationError> {
    if vector.is_empty() {
        return Err(ValidationError::InvalidArgument("query vector is empty".to_string()));
    }
    if let Some(index) = vector.iter().position(|x| !x.is_finite()) {
        return Err(ValidationError::NonFiniteVector {
            id: "<query>".to_string(),
            index,
        });
    }
    Ok(vector.len())
}

pub fn validate_ids<'a>(ids: impl IntoIterator<Item = &'a String>) -> Result<(), ValidationError> {
    if ids.into_iter().any(|id| id.trim().is_empty()) {
        return Err(ValidationError::MissingId);
    }
    Ok(())
}

pub fn validate_path_updates(updates: &[PathUpdate]) -> Result<(), ValidationError> {
    for update in updates {
        if update.old_id.trim().is_empty() || update.new_id.trim().is_empty() {
            return Err(ValidationError::MissingId);
        }
        if update.new_path.trim().is_empty() {
            return Err(ValidationError::InvalidArgument(format!(
                "empty path for {}",
                update.new_id
            )));
        }
    }
    Ok(())
}

/// Known dimension per collection; fixed by the first vector stored
#[derive(Default)]
pub struct DimensionTracker {
    dims: DashMap<CollectionKind, usize>,
}

impl DimensionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: CollectionKind) -> Option<usize> {
        self.dims.get(&kind).map(|d| *d)
    }

    /// Mismatch against the known dimension; unknown accepts anything
    pub fn check(&self, kind: CollectionKind, actual: usize) -> Result<(), ValidationError> {
        match self.get(kind) {
            Some(expected) if expected != actual => Err(ValidationError::DimensionMismatch {
                collection: kind.to_string(),
                expected,
                actual,
            }),
            _ => Ok(()),
        }
    }

    /// Fix the dimension if none is known; `true` when this call established it
    pub fn establish(&self, kind: CollectionKind, dimension: usize) -> bool {
        let mut established = false;
        self.dims.entry(kind).or_insert_with(|| {
            established = true;
            dimension
        });
        established
    }

    /// Overwrite with what the server reports
    pub fn learn(&self, kind: CollectionKind, dimension: usize) {
        self.dims.insert(kind, dimension);
    }

    pub fn forget(&self, kind: CollectionKind) {
        self.dims.remove(&kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_validation() {
        assert_eq!(
            validate_record(&EmbeddingRecord::new(" ", vec![1.0])),
            Err(ValidationError::MissingId)
        );
        assert_eq!(
            validate_record(&EmbeddingRecord::new("a", vec![])),
            Err(ValidationError::MissingVector("a".into()))
        );
        assert_eq!(
            validate_record(&EmbeddingRecord::new("a", vec![1.0, f32::NAN])),
            Err(ValidationError::NonFiniteVector { id: "a".into(), index: 1 })
        );
        assert_eq!(validate_record(&EmbeddingRecord::new("a", vec![1.0, 2.0])), Ok(2));
    }

    #[test]
    fn test_batch_must_be_uniform() {
        let records = vec![
            EmbeddingRecord::new("a", vec![1.0, 2.0]),
            EmbeddingRecord::new("b", vec![1.0]),
        ];
        assert_eq!(
            validate_records(&records),
            Err(ValidationError::MixedDimensions { first: 2, other: 1 })
        );
        assert_eq!(validate_records(&[]), Ok(None));
    }

    #[test]
    fn test_tracker_fixed_by_first_write() {
        let tracker = DimensionTracker::new();
        assert!(tracker.check(CollectionKind::Folders, 3).is_ok());

        assert!(tracker.establish(CollectionKind::Folders, 3));
        assert!(!tracker.establish(CollectionKind::Folders, 4));
        assert_eq!(tracker.get(CollectionKind::Folders), Some(3));
        assert!(tracker.check(CollectionKind::Folders, 4).is_err());
        assert!(tracker.check(CollectionKind::Files, 4).is_ok());

        tracker.forget(CollectionKind::Folders);
        assert_eq!(tracker.get(CollectionKind::Folders), None);
    }

    #[test]
    fn test_path_updates() {
        let update = PathUpdate {
            old_id: "a".into(),
            new_id: "b".into(),
            new_path: "".into(),
            new_name: None,
        };
        assert!(matches!(
            validate_path_updates(&[update]),
            Err(ValidationError::InvalidArgument(_))
        ));
    }
}
