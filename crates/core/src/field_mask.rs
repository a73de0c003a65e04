//! Explicit list of fields a partial update may touch.

use serde::{Deserialize, Serialize};

/// Field mask carried from a partial-update command onto its event.
///
/// An empty mask means "every field": that is how full updates are expressed.
/// Projectors consult the same mask, so a writer never clobbers fields it did not name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask<F>(Vec<F>);

impl<F> Default for FieldMask<F> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<F: Copy + PartialEq> FieldMask<F> {
    /// Mask covering every field.
    pub fn all() -> Self {
        Self(Vec::new())
    }

    /// Mask covering exactly `fields` (duplicates are dropped).
    pub fn only(fields: impl IntoIterator<Item = F>) -> Self {
        let mut out = Vec::new();
        for field in fields {
            if !out.contains(&field) {
                out.push(field);
            }
        }
        Self(out)
    }

    pub fn includes(&self, field: F) -> bool {
        self.0.is_empty() || self.0.contains(&field)
    }

    pub fn is_all(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &[F] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    enum Field {
        Name,
        Amount,
        Owner,
    }

    const ALL: [Field; 3] = [Field::Name, Field::Amount, Field::Owner];

    #[test]
    fn empty_mask_includes_everything() {
        let mask = FieldMask::<Field>::all();
        assert!(ALL.iter().all(|f| mask.includes(*f)));
    }

    #[test]
    fn only_deduplicates() {
        let mask = FieldMask::only([Field::Amount, Field::Amount]);
        assert_eq!(mask.fields(), &[Field::Amount]);
    }

    proptest! {
        #[test]
        fn non_empty_mask_includes_exactly_its_fields(picks in proptest::collection::vec(0usize..3, 1..4)) {
            let chosen: Vec<Field> = picks.iter().map(|i| ALL[*i]).collect();
            let mask = FieldMask::only(chosen.clone());
            for field in ALL {
                prop_assert_eq!(mask.includes(field), chosen.contains(&field));
            }
        }
    }
}
