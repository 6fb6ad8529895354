//! Sorted snowflake container
//!
//! Keeps identifiers in ascending order so membership and lookup are binary searches.

use super::Snowflake;

/// Ascending list of snowflakes with logarithmic lookup.
///
/// Duplicates are kept; lookups find the first matching entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnowflakeList {
    ids: Vec<Snowflake>,
}

impl SnowflakeList {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self { ids: Vec::new() }
    }

    /// Insert an id, keeping the list sorted
    pub fn add(&mut self, id: Snowflake) {
        let index = self.ids.partition_point(|existing| *existing <= id);
        self.ids.insert(index, id);
    }

    /// Look up an id, returning it when present
    pub fn get(&self, id: Snowflake) -> Option<Snowflake> {
        let index = self.ids.partition_point(|existing| *existing < id);
        self.ids.get(index).copied().filter(|found| *found == id)
    }

    /// Check whether an id is present
    pub fn has(&self, id: Snowflake) -> bool {
        self.get(id).is_some()
    }

    /// Remove one occurrence of an id, returning whether it was present
    pub fn remove(&mut self, id: Snowflake) -> bool {
        let index = self.ids.partition_point(|existing| *existing < id);
        if self.ids.get(index) == Some(&id) {
            self.ids.remove(index);
            true
        } else {
            false
        }
    }

    /// Number of stored ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = Snowflake> + '_ {
        self.ids.iter().copied()
    }

    /// Borrow the sorted ids
    pub fn as_slice(&self) -> &[Snowflake] {
        &self.ids
    }
}

impl FromIterator<Snowflake> for SnowflakeList {
    fn from_iter<I: IntoIterator<Item = Snowflake>>(iter: I) -> Self {
        let mut ids: Vec<Snowflake> = iter.into_iter().collect();
        ids.sort_unstable();
        Self { ids }
    }
}

impl Extend<Snowflake> for SnowflakeList {
    fn extend<I: IntoIterator<Item = Snowflake>>(&mut self, iter: I) {
        self.ids.extend(iter);
        self.ids.sort_unstable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::collections::HashSet;

    #[test]
    fn test_add_and_lookup_random_ids() {
        let mut rng = rand::thread_rng();
        let ids: HashSet<u64> = (0..128)
            .map(|_| rng.gen_range(10_000_000_000_000_000..=u64::MAX))
            .collect();

        let mut list = SnowflakeList::new();
        for raw in &ids {
            let id = Snowflake::new(*raw);
            assert!(!list.has(id));
            assert_eq!(list.get(id), None);

            list.add(id);

            assert!(list.has(id));
            assert_eq!(list.get(id), Some(id));
        }

        assert_eq!(list.len(), ids.len());
        assert!(list.as_slice().windows(2).all(|w| w[0] <= w[1]));

        for raw in &ids {
            assert!(list.has(Snowflake::new(*raw)));
        }
    }

    #[test]
    fn test_missing_ids_are_not_found() {
        let list: SnowflakeList = [30, 10, 20].into_iter().map(Snowflake::new).collect();

        assert_eq!(
            list.iter().map(Snowflake::into_inner).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        assert!(!list.has(Snowflake::new(5)));
        assert!(!list.has(Snowflake::new(15)));
        assert!(!list.has(Snowflake::new(35)));
    }

    #[test]
    fn test_duplicates_are_kept() {
        let mut list = SnowflakeList::new();
        list.add(Snowflake::new(7));
        list.add(Snowflake::new(3));
        list.add(Snowflake::new(7));

        assert_eq!(list.len(), 3);
        assert!(list.has(Snowflake::new(7)));

        assert!(list.remove(Snowflake::new(7)));
        assert!(list.has(Snowflake::new(7)));
        assert!(list.remove(Snowflake::new(7)));
        assert!(!list.has(Snowflake::new(7)));
        assert!(!list.remove(Snowflake::new(7)));
    }

    #[test]
    fn test_extend_keeps_order() {
        let mut list = SnowflakeList::new();
        list.add(Snowflake::new(50));
        list.extend([Snowflake::new(1), Snowflake::new(99)]);

        assert_eq!(list.as_slice().first(), Some(&Snowflake::new(1)));
        assert_eq!(list.as_slice().last(), Some(&Snowflake::new(99)));
    }
}
